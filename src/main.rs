use anyhow::Result;

fn main() -> Result<()> {
    safebox::cli::run()
}
