//! CLI subcommand handlers.

use crate::{Commands, ConfigAction, ModelArgs, PhaseArg};
use facebmi_ml::config::WORKSPACE_CONFIG_FILE;
use facebmi_ml::model::Model;
use facebmi_ml::{FacebmiConfig, ModelTrainer, PooledConfig, PooledRegressor};
use std::path::Path;

/// Handle a CLI subcommand.
pub fn handle_command(command: Commands, workspace: &Path, config_file: Option<&Path>) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, workspace, config_file),
        Commands::Train {
            model_name,
            cutoff,
            phase,
            init_weights,
            seed,
            skip_eval,
            model,
        } => {
            let config = load(workspace, config_file)?;
            let mut net = build_model(&config, &model)?;
            if let Some(path) = init_weights {
                net.load_weights(&path)?;
                tracing::info!(path = %path.display(), "Loaded initial weights");
            }

            let mut trainer = ModelTrainer::new(net, &model_name, &cutoff, &config)?.with_seed(seed);
            tracing::info!(run = %trainer.run_id(), cutoff = %cutoff, "Starting training run");
            if matches!(phase, PhaseArg::Top | PhaseArg::Both) {
                trainer.train_top_layer()?;
            }
            if matches!(phase, PhaseArg::All | PhaseArg::Both) {
                trainer.train_all_layers()?;
            }

            if !skip_eval {
                facebmi_ml::test_model(trainer.model(), &config)?;
            }
            Ok(())
        }
        Commands::Evaluate { weights, model } => {
            let config = load(workspace, config_file)?;
            let mut net = build_model(&config, &model)?;
            net.load_weights(&weights)?;
            facebmi_ml::test_model(&net, &config)?;
            Ok(())
        }
    }
}

fn load(workspace: &Path, config_file: Option<&Path>) -> anyhow::Result<FacebmiConfig> {
    facebmi_ml::load_config(Some(workspace), config_file)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
}

fn build_model(config: &FacebmiConfig, args: &ModelArgs) -> anyhow::Result<PooledRegressor> {
    let edge = config.default_img_width;
    let pooled = PooledConfig {
        grid: args.grid,
        hidden: args.hidden,
        seed: args.init_seed,
        ..PooledConfig::default()
    };
    Ok(PooledRegressor::new((edge, edge), &pooled)?)
}

fn handle_config(action: ConfigAction, workspace: &Path, config_file: Option<&Path>) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = workspace.join(WORKSPACE_CONFIG_FILE);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&FacebmiConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace, config_file)?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}
