use anyhow::Result;

fn main() -> Result<()> {
    kelvin_eval::cli::run()
}
