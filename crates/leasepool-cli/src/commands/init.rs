use std::path::Path;

use leasepool::LeasepoolConfig;

pub fn init(path: &str, force: bool) -> anyhow::Result<()> {
    let output = Path::new(path);
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }

    let content = LeasepoolConfig::scaffold().to_toml_string()?;
    std::fs::write(output, content)?;
    println!("✓ Generated {}", output.display());
    Ok(())
}
