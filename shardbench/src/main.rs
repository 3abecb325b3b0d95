use anyhow::Result;

fn main() -> Result<()> {
    shardbench::cli::execute()
}
