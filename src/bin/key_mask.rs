/// Key a local image against a local mask and write the DPI-tagged PNG
///
/// Usage: cargo run --release --bin key_mask -- <image> <mask.png> [--output out.png] [--flow cart|batch]

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use apparel_fulfillment::core::config::Config;
use apparel_fulfillment::core::types::{ImageSource, PrintFlow};
use apparel_fulfillment::services::{
    Compositor, CompositorSettings, HttpImageFetcher, MemoryStorage,
};
use apparel_fulfillment::utils::Metrics;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!(
            "Usage: {} <image> <mask.png> [--output out.png] [--flow cart|batch]",
            args[0]
        );
        std::process::exit(1);
    }

    let image_path = PathBuf::from(&args[1]);
    let mask_path = PathBuf::from(&args[2]);
    let mut output = PathBuf::from("keyed.png");
    let mut flow = PrintFlow::Cart;

    let mut i = 3;
    while i < args.len() {
        match args[i].as_str() {
            "--output" | "-o" if i + 1 < args.len() => {
                output = PathBuf::from(&args[i + 1]);
                i += 2;
            }
            "--flow" | "-f" if i + 1 < args.len() => {
                flow = match args[i + 1].as_str() {
                    "cart" => PrintFlow::Cart,
                    "batch" => PrintFlow::Batch,
                    other => bail!("Unknown flow {:?} (expected cart or batch)", other),
                };
                i += 2;
            }
            _ => i += 1,
        }
    }

    let config = Config::new().context("Failed to load config")?;
    let settings = CompositorSettings::from_config(&config);
    let dpi = config.dpi_for(flow);

    println!("Loading: {} (mask {})", image_path.display(), mask_path.display());
    let image = tokio::fs::read(&image_path)
        .await
        .with_context(|| format!("Failed to read {}", image_path.display()))?;
    let mask = tokio::fs::read(&mask_path)
        .await
        .with_context(|| format!("Failed to read {}", mask_path.display()))?;

    let compositor = Compositor::new(
        settings,
        Arc::new(HttpImageFetcher::new(config.composite.fetch_timeout)?),
        Arc::new(MemoryStorage::new()),
        Metrics::new(),
    );

    let start = std::time::Instant::now();
    let png = compositor
        .key_composite(&ImageSource::from(image), Arc::new(mask), flow)
        .await
        .context("Keying failed")?;

    tokio::fs::write(&output, &png)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!(
        "Wrote {} ({} bytes, {} dpi) in {:.2}s",
        output.display(),
        png.len(),
        dpi,
        start.elapsed().as_secs_f64()
    );
    Ok(())
}
