//! Per-command handlers. Each one opens the file (or creates it for `new`),
//! calls the engine and prints the result. Mutating commands save before
//! returning.

use super::render::{render_attributes, render_tree};
use super::setup::{Cli, Commands, MoveDirection};
use colored::Colorize;
use keyminder::cipher::available_suites;
use keyminder::config::default_config_dir;
use keyminder::prompt::ConsolePrompt;
use keyminder::{Direction, EngineContext, KeyMinder, KeyMinderError, NodeId, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

struct AppContext {
    engine: KeyMinder,
    file: Option<PathBuf>,
    password: Option<String>,
    format: Option<String>,
}

pub fn run(cli: Cli) -> Result<()> {
    let mut ctx = init_context(&cli)?;

    match cli.command {
        Commands::New { encrypt } => handle_new(&mut ctx, encrypt),
        Commands::Formats => handle_formats(&ctx),
        command => {
            open_file(&mut ctx)?;
            match command {
                Commands::Tree { ids } => handle_tree(&ctx, ids),
                Commands::Add { parent, text } => handle_add(&mut ctx, &parent, &text.join(" ")),
                Commands::Rm { path } => handle_rm(&mut ctx, &path),
                Commands::Move { path, direction } => handle_move(&mut ctx, &path, direction),
                Commands::Sort { path, recursive } => handle_sort(&mut ctx, &path, recursive),
                Commands::Set { path, key, value } => handle_set(&mut ctx, &path, &key, value),
                Commands::Get { path, key } => handle_get(&ctx, &path, key.as_deref()),
                Commands::Link { name, path } => handle_link(&mut ctx, name, path),
                Commands::Passwd { new, remove } => handle_passwd(&mut ctx, new, remove),
                Commands::Cipher { name } => handle_cipher(&mut ctx, name),
                Commands::Convert { output, to_format } => {
                    handle_convert(&mut ctx, &output, to_format.as_deref())
                }
                Commands::New { .. } | Commands::Formats => Ok(()),
            }
        }
    }
}

fn init_context(cli: &Cli) -> Result<AppContext> {
    let config_dir = cli.config_dir.clone().or_else(default_config_dir);
    let engine_ctx = match &config_dir {
        Some(dir) => EngineContext::load(dir)?,
        None => EngineContext::default(),
    };
    debug!(config_dir = ?config_dir, "engine context loaded");

    Ok(AppContext {
        engine: KeyMinder::new(engine_ctx),
        file: cli.file.clone(),
        password: cli.password.clone(),
        format: cli.format.clone(),
    })
}

fn file_path(ctx: &AppContext) -> Result<PathBuf> {
    ctx.file.clone().ok_or_else(|| {
        KeyMinderError::InvalidOperation("no file given (use --file)".to_string())
    })
}

fn open_file(ctx: &mut AppContext) -> Result<()> {
    let path = file_path(ctx)?;
    let format = ctx.format.as_deref();
    match ctx.password.as_deref() {
        Some(password) => ctx.engine.open(&path, Some(password), format),
        None => ctx
            .engine
            .open_with_prompt(&path, &mut ConsolePrompt::new(), format),
    }
}

fn resolve(ctx: &AppContext, path: &str) -> Result<NodeId> {
    ctx.engine
        .document()
        .node_by_path(path)
        .ok_or_else(|| KeyMinderError::InvalidOperation(format!("no node at '{path}'")))
}

fn resolve_non_root(ctx: &AppContext, path: &str) -> Result<NodeId> {
    let id = resolve(ctx, path)?;
    if id.is_root() {
        return Err(KeyMinderError::InvalidOperation(
            "the root node cannot be changed".to_string(),
        ));
    }
    Ok(id)
}

fn handle_new(ctx: &mut AppContext, encrypt: bool) -> Result<()> {
    let path = file_path(ctx)?;
    if path.exists() {
        return Err(KeyMinderError::InvalidOperation(format!(
            "{} already exists",
            path.display()
        )));
    }
    ctx.engine.create()?;
    if encrypt {
        match ctx.password.clone() {
            Some(password) => ctx.engine.set_password(&password)?,
            None => {
                if !ctx
                    .engine
                    .change_password_interactive(&mut ConsolePrompt::new())?
                {
                    return Err(KeyMinderError::InvalidOperation(
                        "the passwords do not match".to_string(),
                    ));
                }
            }
        }
    }
    let format = ctx.format.clone();
    ctx.engine.save_as(&path, format.as_deref())?;
    println!("{} {}", "Created".green(), path.display());
    Ok(())
}

fn handle_formats(ctx: &AppContext) -> Result<()> {
    let registry = ctx.engine.registry();
    for id in registry.identifiers() {
        let handler = registry.get(id)?;
        let marker = if id == registry.default_id() { "*" } else { " " };
        println!(
            "{} {:<10} {:<18} {}",
            marker.yellow(),
            id,
            handler.extensions().join(", "),
            handler.description().dimmed()
        );
    }
    Ok(())
}

fn handle_tree(ctx: &AppContext, ids: bool) -> Result<()> {
    print!("{}", render_tree(ctx.engine.document(), ids));
    Ok(())
}

fn handle_add(ctx: &mut AppContext, parent: &str, text: &str) -> Result<()> {
    let parent = resolve(ctx, parent)?;
    let id = ctx.engine.document_mut().add_new(parent, text)?;
    ctx.engine.save()?;
    let path = ctx.engine.document().node_path(id)?;
    println!("{} {}", "Added".green(), path);
    Ok(())
}

fn handle_rm(ctx: &mut AppContext, path: &str) -> Result<()> {
    let id = resolve_non_root(ctx, path)?;
    ctx.engine.document_mut().remove(id)?;
    ctx.engine.save()?;
    println!("{} {}", "Removed".green(), path);
    Ok(())
}

fn handle_move(ctx: &mut AppContext, path: &str, direction: MoveDirection) -> Result<()> {
    let id = resolve_non_root(ctx, path)?;
    let direction = match direction {
        MoveDirection::Up => Direction::Up,
        MoveDirection::Down => Direction::Down,
    };
    if ctx.engine.document_mut().move_node(id, direction)? {
        ctx.engine.save()?;
    } else {
        println!("{}", "Already at the edge.".dimmed());
    }
    Ok(())
}

fn handle_sort(ctx: &mut AppContext, path: &str, recursive: bool) -> Result<()> {
    let id = resolve(ctx, path)?;
    ctx.engine.document_mut().sort_children(id, recursive)?;
    ctx.engine.save()
}

fn handle_set(ctx: &mut AppContext, path: &str, key: &str, value: String) -> Result<()> {
    let id = resolve_non_root(ctx, path)?;
    ctx.engine.document_mut().set_attribute(id, key, value)?;
    ctx.engine.save()
}

fn handle_get(ctx: &AppContext, path: &str, key: Option<&str>) -> Result<()> {
    let id = resolve(ctx, path)?;
    let node = ctx.engine.document().node(id)?;
    match key {
        Some(key) => {
            let value = node.attribute(key).ok_or_else(|| {
                KeyMinderError::InvalidOperation(format!("'{path}' has no attribute '{key}'"))
            })?;
            println!("{value}");
        }
        None => print!("{}", render_attributes(node)),
    }
    Ok(())
}

fn handle_link(ctx: &mut AppContext, name: Option<String>, path: Option<String>) -> Result<()> {
    match (name, path) {
        (None, _) => {
            let doc = ctx.engine.document();
            for (name, id) in ctx.engine.quicklinks() {
                println!("{} -> {}", name.yellow(), doc.node_path(id)?);
            }
            return Ok(());
        }
        (Some(name), Some(path)) => {
            let id = resolve_non_root(ctx, &path)?;
            ctx.engine.add_quicklink(&name, id)?;
        }
        (Some(name), None) => {
            if !ctx.engine.remove_quicklink(&name)? {
                return Err(KeyMinderError::InvalidOperation(format!(
                    "no quicklink named '{name}'"
                )));
            }
        }
    }
    ctx.engine.document_mut().set_changed(true);
    ctx.engine.save()
}

fn handle_passwd(ctx: &mut AppContext, new: Option<String>, remove: bool) -> Result<()> {
    let encrypted = ctx.engine.file().is_some_and(|f| f.is_encrypted());
    if remove {
        ctx.engine.disable_encryption()?;
        ctx.engine.save()?;
        println!("{}", "Encryption removed.".yellow());
        return Ok(());
    }

    match new {
        Some(new) if encrypted => {
            let current = ctx.password.clone().ok_or_else(|| {
                KeyMinderError::InvalidOperation(
                    "changing the password needs the current one (--password)".to_string(),
                )
            })?;
            ctx.engine.change_password(&current, &new)?;
        }
        Some(new) => ctx.engine.set_password(&new)?,
        None => {
            if !ctx
                .engine
                .change_password_interactive(&mut ConsolePrompt::new())?
            {
                return Err(KeyMinderError::InvalidOperation(
                    "the passwords do not match".to_string(),
                ));
            }
        }
    }
    ctx.engine.save()?;
    println!("{}", "Password changed.".green());
    Ok(())
}

fn handle_cipher(ctx: &mut AppContext, name: Option<String>) -> Result<()> {
    if let Some(name) = name {
        ctx.engine.set_cipher(&name)?;
        ctx.engine.save()?;
        println!("{} {}", "Cipher set to".green(), name);
        return Ok(());
    }

    let current = ctx.engine.file().and_then(|f| f.cipher().cipher_name());
    let strength = ctx.engine.cipher_strength();
    match current {
        Some(name) => println!("{} ({} bit)", name.bold(), strength.key_bits),
        None => println!("{}", "not encrypted".dimmed()),
    }
    if strength.degraded {
        println!(
            "{}",
            "Warning: only reduced-strength ciphers are available.".yellow()
        );
    }
    for suite in available_suites(ctx.engine.config().max_key_bits) {
        let marker = if Some(suite.name) == current { "*" } else { " " };
        println!("{} {}", marker.yellow(), suite.name);
    }
    Ok(())
}

fn handle_convert(ctx: &mut AppContext, output: &Path, format: Option<&str>) -> Result<()> {
    ctx.engine.save_as(output, format)?;
    println!("{} {}", "Written".green(), output.display());
    Ok(())
}
