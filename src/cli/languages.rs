use anyhow::Result;
use clap::Parser;

use crate::config::GlobalConfig;
use crate::lang::Registry;
use crate::webapp::LanguageInfo;

#[derive(Parser, Debug)]
pub struct LanguagesArgs {
    /// Print the listing as JSON instead of a table
    #[arg(long)]
    json: bool,
}

fn table(languages: &[LanguageInfo]) -> String {
    let mut out = format!("{:<12} {:<12} {:<8} {:<12} {}\n", "ID", "KIND", "RUNTIME", "SOURCE", "AVAILABLE");
    for l in languages {
        out.push_str(&format!(
            "{:<12} {:<12} {:<8} {:<12} {}\n",
            l.id.to_string(),
            l.kind,
            l.runtime,
            l.source_file,
            if l.available { "yes" } else { "no" },
        ));
    }
    out
}

pub async fn run(args: LanguagesArgs, config: &GlobalConfig) -> Result<()> {
    let registry = Registry::with_overrides(&config.toolchains)?;
    let languages: Vec<LanguageInfo> = registry.iter()
        .map(|toolchain| LanguageInfo::from_toolchain(toolchain, &config.search_path))
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&languages)?);
    } else {
        print!("{}", table(&languages));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_has_a_row_per_language() {
        let registry = Registry::builtin();
        let languages: Vec<LanguageInfo> = registry.iter().map(|t| LanguageInfo::from_toolchain(t, &[])).collect();
        let out = table(&languages);
        assert_eq!(out.lines().count(), 7);
        assert!(out.lines().any(|line| line.starts_with("java ") && line.contains("Main.java")));
    }
}
