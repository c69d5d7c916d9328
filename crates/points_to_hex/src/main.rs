use anyhow::{Context, Result};
use clap::Parser;
use gvi::features::{write_hex_cells, PointLayer};
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

/// `points_to_hex` - average scored points onto H3 hexagons.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// GeoJSON written by `score_images`.
    #[arg(long, env = "GVI_SCORED_POINTS")]
    input: PathBuf,

    /// Output GeoJSON of hexagon polygons.
    #[arg(long, env = "GVI_HEXAGONS")]
    output: PathBuf,

    /// H3 resolution, 0 (coarsest) to 15.
    #[arg(long, default_value_t = 10, env = "GVI_HEX_RESOLUTION",
          value_parser = clap::value_parser!(u8).range(0..=15))]
    resolution: u8,
}

fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();
    let args = Args::parse();
    tracing::info!(args = ?args, "points_to_hex starting");

    let layer = PointLayer::read(&args.input)
        .with_context(|| format!("Failed to load points from '{}'", args.input.display()))?;

    let cells = gvi::aggregate(&layer.scored_locations(), args.resolution)
        .context("Failed to aggregate scores")?;

    write_hex_cells(&args.output, &cells)
        .with_context(|| format!("Failed to write '{}'", args.output.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_is_bounded() {
        let parse = |res: &str| {
            Args::try_parse_from(["points_to_hex", "--input", "a", "--output", "b", "--resolution", res])
        };
        assert_eq!(parse("15").unwrap().resolution, 15);
        assert!(parse("16").is_err());
    }
}
