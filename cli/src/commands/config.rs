use anyhow::Result;
use seedalchemy_core::Config;

pub async fn execute(key: Option<&str>, value: Option<&str>) -> Result<()> {
    let mut config = Config::load()?;

    match (key, value) {
        // Show all config
        (None, None) => {
            println!("Configuration file: {:?}\n", Config::config_path()?);
            print!("{}", toml::to_string_pretty(&config)?);
        }

        // Get a specific key
        (Some(key), None) => {
            println!("{}", config.get_value(key)?);
        }

        // Set a specific key
        (Some(key), Some(value)) => {
            config.set_value(key, value)?;
            config.save()?;
            println!("Set {} = {}", key, value);
        }

        (None, Some(_)) => anyhow::bail!("A value needs a key"),
    }

    Ok(())
}
