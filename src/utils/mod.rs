pub mod image_ops;
pub mod metrics;

// Re-export commonly used items
pub use image_ops::{
    decode_base64_padded, encode_jpeg_flattened, encode_png, encode_png_with_dpi,
    load_image_from_memory_async, png_data_url, reencode_jpeg_async, resize_exact_async,
};
pub use metrics::Metrics;
