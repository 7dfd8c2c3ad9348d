use anyhow::{Context, Result};
use kube::CustomResourceExt;

use crate::operator::crd::{Frontend, FrontendEnvironment};
use crate::operator::settings::Settings;

#[derive(Debug, Clone, clap::Subcommand)]
pub enum OperatorCommands {
    /// Start the Frontend and FrontendEnvironment controllers
    Run,
    /// Check operator configuration for errors and unused options
    CheckConfig,
    /// Print the CustomResourceDefinitions as YAML
    Crds,
}

fn render_crds() -> Result<String> {
    let frontend =
        serde_yaml::to_string(&Frontend::crd()).context("Failed to render Frontend CRD")?;
    let environment = serde_yaml::to_string(&FrontendEnvironment::crd())
        .context("Failed to render FrontendEnvironment CRD")?;
    Ok(format!("{}---\n{}", frontend, environment))
}

pub async fn handle_operator_command(cmd: OperatorCommands) -> Result<()> {
    match cmd {
        OperatorCommands::Run => {
            let settings = Settings::new()?;
            crate::operator::run(settings).await
        }
        OperatorCommands::CheckConfig => {
            println!("Checking operator configuration...");
            match Settings::new() {
                Ok(settings) => {
                    println!("✓ Configuration is valid");
                    println!("  config namespace: {}", settings.operator.config_namespace);
                    Ok(())
                }
                Err(e) => {
                    eprintln!("✗ Configuration error: {}", e);
                    std::process::exit(1);
                }
            }
        }
        OperatorCommands::Crds => {
            print!("{}", render_crds()?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_crds() {
        let yaml = render_crds().unwrap();
        assert!(yaml.contains("name: frontends.rise.dev"));
        assert!(yaml.contains("name: frontendenvironments.rise.dev"));
        assert_eq!(yaml.matches("\n---\n").count(), 1);
    }
}
