//! `phaserun init`: write a starter configuration into the current directory.
//!
//! Pure logic takes closures for filesystem access so it can be tested
//! without touching disk.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::CONFIG_FILE;
use crate::templates;

/// Keeps run artifacts out of version control.
const STATE_GITIGNORE: &str = "*\n";

pub(crate) fn run(force: bool) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    info!("Initializing phaserun in {}", cwd.display());

    let files = init_files();
    let results = init_project(
        &files,
        force,
        |path| cwd.join(path).exists(),
        |path| {
            fs::create_dir_all(cwd.join(path))
                .with_context(|| format!("Failed to create directory: {}", path.display()))
        },
        |path, content| {
            fs::write(cwd.join(path), content)
                .with_context(|| format!("Failed to write {}", path.display()))
        },
    )?;

    print!("{}", format_results(&results, &files));
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct InitFile {
    path: PathBuf,
    content: &'static str,
    description: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteResult {
    Created,
    Overwritten,
    Skipped,
}

fn init_files() -> Vec<InitFile> {
    vec![
        InitFile {
            path: PathBuf::from(CONFIG_FILE),
            content: templates::PHASERUN_TOML,
            description: "Pools, sandboxes, agent and tasks",
        },
        InitFile {
            path: PathBuf::from(".phaserun/.gitignore"),
            content: STATE_GITIGNORE,
            description: "Keeps results and logs out of git",
        },
    ]
}

fn init_project<E, D, W>(
    files: &[InitFile],
    force: bool,
    exists: E,
    create_dir: D,
    mut write_file: W,
) -> Result<Vec<(PathBuf, WriteResult)>>
where
    E: Fn(&Path) -> bool,
    D: Fn(&Path) -> Result<()>,
    W: FnMut(&Path, &str) -> Result<()>,
{
    for dir in files
        .iter()
        .filter_map(|f| f.path.parent())
        .filter(|p| !p.as_os_str().is_empty())
    {
        create_dir(dir)?;
    }

    let mut results = Vec::with_capacity(files.len());
    for file in files {
        let existed = exists(&file.path);
        let result = match (existed, force) {
            (true, false) => WriteResult::Skipped,
            (true, true) => {
                write_file(&file.path, file.content)?;
                WriteResult::Overwritten
            }
            (false, _) => {
                write_file(&file.path, file.content)?;
                WriteResult::Created
            }
        };
        results.push((file.path.clone(), result));
    }
    Ok(results)
}

fn format_results(results: &[(PathBuf, WriteResult)], files: &[InitFile]) -> String {
    let mut lines = vec![
        String::new(),
        format!("{} phaserun initialized", "✓".green().bold()),
        String::new(),
        "Files:".to_string(),
    ];

    for (path, result) in results {
        let desc = files
            .iter()
            .find(|f| &f.path == path)
            .map_or("", |f| f.description);
        lines.push(match result {
            WriteResult::Created => format!("  {} - {desc}", path.display().to_string().cyan()),
            WriteResult::Overwritten => format!("  {} {} (overwritten)", "↻".blue(), path.display()),
            WriteResult::Skipped => format!(
                "  {} {} (already exists, use --force to overwrite)",
                "⊘".yellow(),
                path.display()
            ),
        });
    }

    lines.push(String::new());
    lines.push("Next steps:".yellow().bold().to_string());
    lines.push(format!(
        "  1. Edit {} to describe your tasks and agent",
        CONFIG_FILE.cyan()
    ));
    lines.push(format!("  2. Run {} to validate it", "phaserun check".green()));
    lines.push(format!("  3. Run {} to execute every task", "phaserun run".green()));
    lines.push(String::new());
    lines.join("\n")
}
