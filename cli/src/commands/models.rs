use anyhow::Result;
use seedalchemy_core::{schedulers, Config, ModelRegistry};

pub async fn execute() -> Result<()> {
    let config = Config::load()?;
    let registry = ModelRegistry::from_config(&config.models)?;
    let models = registry.list();

    if models.is_empty() {
        println!("No models registered.");
        println!("\nSet `models.models_path` or `models.huggingface_models` with `seed-alchemy config`.");
        return Ok(());
    }

    println!("{:<20} {:<14} {}", "TYPE", "BASE", "NAME");
    println!("{}", "-".repeat(72));

    for model in models {
        println!("{:<20} {:<14} {}", model.kind, model.base, model.name);
    }

    Ok(())
}

pub async fn schedulers() -> Result<()> {
    let mut ids = schedulers::ids().to_vec();
    ids.sort_unstable();
    for id in ids {
        println!("{}", id);
    }
    Ok(())
}
