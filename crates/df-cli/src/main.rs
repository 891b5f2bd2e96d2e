//! External CLI wrapper (spec §6 "external interfaces"): parses
//! `--main`/`-m`, `--cycle-time`/`-t`, a config-file override, and any
//! `--key=value` structure-parameter overrides the referenced XML
//! declares, then drives the process-wide [`RuntimeEnvironment`] through
//! instantiation and teardown.
//!
//! Grounded in `ox-bin`'s `Args`/`AppStartup` split and `configure_logging`
//! (same `tracing-appender` rolling-file + `EnvFilter` setup), and in
//! `core-config`'s `discover`/`load_from` shape for config-file lookup —
//! generalized here from a single `[scroll.margin]` field to an arbitrary
//! TOML document flattened into slash-separated paths.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;

use anyhow::{Context, Result};
use clap::Parser;
use df_runtime::RuntimeEnvironment;
use df_structure::{CommandLineValues, ConfigValues};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

/// Used only for the `cycle_time_configured` log line; this core does not
/// schedule user threads itself (spec.md Non-goals).
const DEFAULT_CYCLE_TIME_MS: u64 = 100;

/// CLI arguments (spec §6).
#[derive(Parser, Debug)]
#[command(name = "dfcore", version, about = "Dataflow runtime core")]
struct Args {
    /// `[group:]file.xml` naming the main finstructable group to instantiate.
    #[arg(long = "main", short = 'm')]
    main: Option<String>,

    /// Scheduling cycle time in milliseconds; recorded for observers, not
    /// enforced here (spec.md Non-goals: "hard real-time scheduling of
    /// user threads").
    #[arg(long = "cycle-time", short = 't')]
    cycle_time: Option<u64>,

    /// Config file path, overriding discovery of `dfcore.toml`.
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Log file path; defaults to `dfcore.log` in the working directory.
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,

    /// Additional `.xml` files to instantiate, interleaved with any
    /// `--key=value` overrides declared by the referenced groups (spec §6:
    /// "plus any extra options declared in the referenced XML").
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    rest: Vec<String>,
}

struct AppStartup {
    log_guard: Option<WorkerGuard>,
}

impl AppStartup {
    fn new() -> Self {
        Self { log_guard: None }
    }

    fn configure_logging(&mut self, log_file: Option<&Path>) -> Result<()> {
        let path = log_file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("dfcore.log"));
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("dfcore.log");

        let file_appender = tracing_appender::rolling::never(dir, file_name);
        let (nb_writer, guard) = tracing_appender::non_blocking(file_appender);
        match tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(nb_writer)
            .try_init()
        {
            Ok(()) => self.log_guard = Some(guard),
            Err(_) => {
                // A subscriber is already installed (e.g. under `cargo test`); drop
                // the guard so the non-blocking writer thread shuts down cleanly.
            }
        }
        Ok(())
    }

    fn install_panic_hook() {
        static HOOK: Once = Once::new();
        HOOK.call_once(|| {
            let default_panic = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |info| {
                tracing::error!(target: "df.cli.panic", ?info, "panic");
                default_panic(info);
            }));
        });
    }
}

/// Splits a `[group:]file.xml` spec into an optional group-name override
/// and the file path.
fn split_main_spec(spec: &str) -> (Option<&str>, &str) {
    match spec.split_once(':') {
        Some((group, file)) if !group.is_empty() => (Some(group), file),
        _ => (None, spec),
    }
}

/// Separates trailing CLI arguments into XML file paths and `--key=value`
/// structure-parameter overrides.
fn split_rest(rest: &[String]) -> (Vec<PathBuf>, CommandLineValues) {
    let mut paths = Vec::new();
    let mut cli = CommandLineValues::new();
    for arg in rest {
        if let Some(stripped) = arg.strip_prefix("--") {
            if let Some((key, value)) = stripped.split_once('=') {
                cli.set(key, value);
                continue;
            }
        }
        paths.push(PathBuf::from(arg));
    }
    (paths, cli)
}

/// Best-effort config path, preferring the working directory before a
/// platform config dir (`core-config::discover`'s shape).
fn discover_config() -> PathBuf {
    let local = PathBuf::from("dfcore.toml");
    if local.exists() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        return dir.join("dfcore").join("dfcore.toml");
    }
    PathBuf::from("dfcore.toml")
}

fn load_config(path: Option<PathBuf>) -> ConfigValues {
    let path = path.unwrap_or_else(discover_config);
    let mut values = ConfigValues::new();
    let Ok(content) = fs::read_to_string(&path) else {
        return values;
    };
    match content.parse::<toml::Value>() {
        Ok(value) => flatten_toml(&value, "", &mut values),
        Err(err) => {
            tracing::warn!(
                target: "df.cli",
                %err,
                path = %path.display(),
                "config_parse_failed_using_defaults"
            );
        }
    }
    values
}

/// Flattens a parsed TOML document into `/a/b`-style structure-parameter
/// config paths (spec §4.G `config_entry`); nested tables recurse, arrays
/// are logged and skipped since no structure parameter binds to one.
fn flatten_toml(value: &toml::Value, prefix: &str, out: &mut ConfigValues) {
    match value {
        toml::Value::Table(table) => {
            for (key, v) in table {
                let path = if prefix.is_empty() {
                    format!("/{key}")
                } else {
                    format!("{prefix}/{key}")
                };
                flatten_toml(v, &path, out);
            }
        }
        toml::Value::String(s) => out.set(prefix, s.clone()),
        toml::Value::Integer(i) => out.set(prefix, i.to_string()),
        toml::Value::Float(f) => out.set(prefix, f.to_string()),
        toml::Value::Boolean(b) => out.set(prefix, b.to_string()),
        toml::Value::Datetime(d) => out.set(prefix, d.to_string()),
        toml::Value::Array(_) => {
            tracing::debug!(
                target: "df.cli",
                path = prefix,
                "array config values are not bound to structure parameters"
            );
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut startup = AppStartup::new();
    startup.configure_logging(args.log_file.as_deref())?;
    AppStartup::install_panic_hook();

    info!(target: "df.cli", "startup");

    let env = RuntimeEnvironment::instance();

    let (mut xml_paths, mut cli) = split_rest(&args.rest);
    if let Some(spec) = &args.main {
        let (group, file) = split_main_spec(spec);
        if let Some(group) = group {
            info!(target: "df.cli", group, "main_group_name_override");
        }
        xml_paths.insert(0, PathBuf::from(file));
    }
    if let Some(ms) = args.cycle_time {
        cli.set("cycle-time", ms.to_string());
    }
    env.set_command_line_values(cli);
    env.set_config_values(load_config(args.config.clone()));

    let cycle_time_ms = args.cycle_time.unwrap_or(DEFAULT_CYCLE_TIME_MS);
    info!(target: "df.cli", cycle_time_ms, "cycle_time_configured");

    let mut groups = Vec::new();
    for path in &xml_paths {
        let xml = fs::read_to_string(path)
            .with_context(|| format!("reading finstructable group file `{}`", path.display()))?;
        let group = env
            .instantiate_main_group(&xml)
            .with_context(|| format!("instantiating `{}`", path.display()))?;
        info!(
            target: "df.cli",
            file = %path.display(),
            name = group.element().name(),
            "group_instantiated"
        );
        groups.push(group);
    }

    if groups.is_empty() {
        error!(target: "df.cli", "no finstructable group files given; nothing to do");
    }

    // Dataflow execution itself (scheduling user threads at `cycle_time_ms`)
    // is out of scope for this core (spec.md Non-goals); the wrapper's job
    // ends at instantiation, edge resolution, and teardown.
    for group in &groups {
        let unresolved = group.retry_pending_link_edges();
        if unresolved > 0 {
            tracing::warn!(
                target: "df.cli",
                unresolved,
                name = group.element().name(),
                "group_has_unresolved_link_edges"
            );
        }
    }

    env.shutdown();
    Ok(())
}
