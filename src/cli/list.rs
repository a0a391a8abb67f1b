//! `nova-extd list`.

use std::rc::Rc;

use anyhow::Result;
use console::style;

use crate::config::Config;
use crate::extensions::{ExtensionHost, NoopCache};

use super::run::StdoutUi;

/// Print every installed extension with its triggers and compatibility.
pub fn run_list(config: &Config) -> Result<()> {
    let host = ExtensionHost::new(config.clone(), Rc::new(StdoutUi), Rc::new(NoopCache))?;

    if host.extension_count() == 0 {
        println!(
            "{}",
            style(format!(
                "No extensions found in {}",
                config.extensions_dir().display()
            ))
            .dim()
        );
        return Ok(());
    }

    for ext_id in host.extension_ids() {
        let Some(manifest) = host.manifest(&ext_id) else {
            continue;
        };

        let status = match manifest.check_compatibility() {
            Ok(()) => style("✓").green().bold(),
            Err(_) => style("✗").red().bold(),
        };
        println!(
            "{} {} {}",
            status,
            style(&manifest.extension.title).bold(),
            style(format!("({} {})", ext_id, manifest.extension.version)).dim()
        );

        if !manifest.extension.description.is_empty() {
            println!("    {}", manifest.extension.description);
        }
        for trigger in &manifest.triggers {
            let name = if trigger.name.is_empty() {
                &trigger.id
            } else {
                &trigger.name
            };
            println!("    {} {}", style(&trigger.keyword).cyan(), name);
        }
    }

    Ok(())
}
