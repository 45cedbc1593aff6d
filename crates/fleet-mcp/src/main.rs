use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use env_flags::env_flags;
use once_cell::sync::OnceCell;
use rust_mcp_sdk::error::SdkResult;
use rust_mcp_sdk::mcp_server::{
    HyperServerOptions, ServerRuntime, hyper_server_core, server_runtime_core,
};
use rust_mcp_sdk::schema::{
    Implementation, InitializeResult, LATEST_PROTOCOL_VERSION, ServerCapabilities,
    ServerCapabilitiesTools,
};
use rust_mcp_sdk::{McpServer, StdioTransport, TransportOptions};

use fleet_mcp::config::{UserConfig, expand_home, load_user_config};
use fleet_mcp::handler::FleetServerHandler;
use fleet_mcp::{Fleet, FleetSettings};

env_flags! {
    /// Fleet home directory (absolute). Defaults to $HOME/.fleet
    FLEET_HOME: &str = "";
}

fn resolve_fleet_home(workspace_dir: &Path) -> PathBuf {
    if !(*FLEET_HOME).is_empty() {
        PathBuf::from((*FLEET_HOME).to_string())
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".fleet")
    } else {
        workspace_dir.join(".fleet")
    }
}

fn init_tracing(fleet_home: &Path, user_cfg: Option<&UserConfig>) {
    env_flags! {
        /// Tracing filter, e.g. "info", "debug", or targets format.
        RUST_LOG: &str = "info";
        /// Preferred filter env (alias). If set, overrides RUST_LOG.
        TRACING_FILTER: &str = "";
        /// Pretty formatting for logs (ignored if TRACING_JSON=true).
        TRACING_PRETTY: bool = false;
        /// Compact single-line formatting for logs (ignored if TRACING_JSON=true)
        TRACING_COMPACT: bool = true;
        /// JSON formatting for logs
        TRACING_JSON: bool = false;
        /// If true, also log to file under <FLEET_HOME>/logs or LOG_DIR
        LOG_TO_FILE: bool = true;
        /// Optional explicit log directory (absolute). Defaults to <FLEET_HOME>/logs
        LOG_DIR: &str = "";
    }

    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, prelude::*};

    let env_set = |k: &str| std::env::var_os(k).is_some();

    let mut rust_log = if !(*TRACING_FILTER).is_empty() {
        (*TRACING_FILTER).to_string()
    } else {
        (*RUST_LOG).to_string()
    };
    let mut tracing_json = *TRACING_JSON;
    let mut tracing_compact = *TRACING_COMPACT;
    let mut tracing_pretty = *TRACING_PRETTY;
    let mut log_to_file = *LOG_TO_FILE;
    let mut log_dir: Option<PathBuf> = if !(*LOG_DIR).is_empty() {
        Some(PathBuf::from((*LOG_DIR).to_string()))
    } else {
        None
    };

    if let Some(cfg) = user_cfg.and_then(|c| c.logging.as_ref()) {
        if !(env_set("TRACING_FILTER") || env_set("RUST_LOG"))
            && let Some(level) = cfg.level.as_ref()
        {
            rust_log = level.clone();
        }
        if !env_set("TRACING_JSON")
            && let Some(v) = cfg.json
        {
            tracing_json = v;
        }
        if !env_set("TRACING_COMPACT")
            && let Some(v) = cfg.compact
        {
            tracing_compact = v;
        }
        if !env_set("TRACING_PRETTY")
            && let Some(v) = cfg.pretty
        {
            tracing_pretty = v;
        }
        if !env_set("LOG_TO_FILE")
            && let Some(v) = cfg.to_file
        {
            log_to_file = v;
        }
        if !env_set("LOG_DIR")
            && let Some(dir) = cfg.dir.as_ref()
        {
            log_dir = Some(expand_home(dir));
        }
    }

    let filter = EnvFilter::try_new(rust_log).unwrap_or_else(|_| EnvFilter::new("info"));

    // Always write logs to stderr; stdout carries stdio JSON-RPC.
    let base = tracing_subscriber::fmt::layer()
        .with_file(false)
        .with_line_number(false)
        .with_target(true)
        .with_ansi(true)
        .with_writer(std::io::stderr);

    static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();
    let mut dir_error = None;
    let file_writer = if log_to_file {
        let dir = log_dir.unwrap_or_else(|| fleet_home.join("logs"));
        match std::fs::create_dir_all(&dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, "fleet-mcp.log");
                let (nb, guard) = tracing_appender::non_blocking(appender);
                let _ = FILE_GUARD.set(guard);
                Some(nb)
            }
            Err(e) => {
                dir_error = Some(format!("failed to create log dir {}: {}", dir.display(), e));
                None
            }
        }
    } else {
        None
    };
    let reg = tracing_subscriber::registry().with(filter);

    // Same style on stderr and in the file; `Option<Layer>` is a no-op when None.
    macro_rules! install {
        ($($style:ident)?) => {{
            let stderr_layer = base $(.$style())?;
            let file_layer = file_writer.map(|nb| {
                tracing_subscriber::fmt::layer()
                    .with_file(false)
                    .with_line_number(false)
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(nb)
                    $(.$style())?
            });
            if let Err(e) = reg.with(stderr_layer).with(file_layer).try_init() {
                tracing::debug!("tracing already set: {:?}", e);
            }
        }};
    }

    if tracing_json {
        install!(json);
    } else if tracing_compact {
        install!(compact);
    } else if tracing_pretty {
        install!(pretty);
    } else {
        install!();
    }
    if let Some(msg) = dir_error {
        tracing::warn!("{}", msg);
    }
}

fn split_paths(raw: &str) -> Vec<PathBuf> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(expand_home)
        .collect()
}

#[tokio::main]
async fn main() -> SdkResult<()> {
    env_flags! {
        /// Transport: "stdio" (default) or "http"
        TRANSPORT: &str = "stdio";
        /// Host for HTTP transport
        HOST: &str = "127.0.0.1";
        /// Port for HTTP transport
        PORT: u16 = 8081;
        /// Ping interval for HTTP SSE
        PING_SECS: u64 = 5;
        /// Enable JSON response mode for HTTP
        HTTP_JSON: bool = false;
        /// Workspace directory. If empty, defaults to the current execution directory.
        WORKSPACE_DIR: &str = "";
        /// Agent template files (comma-separated, later wins). Appended after the defaults.
        FLEET_TEMPLATE_FILES: &str = "";
        /// Teams file. Defaults to <FLEET_HOME>/teams.toml
        FLEET_TEAMS_FILE: &str = "";
        /// Liveness grace period after starting a process or container
        FLEET_GRACE_MS: u64 = 3000;
        /// Pause after each successful member in sequential team starts
        FLEET_SETTLE_MS: u64 = 2000;
        /// Pause between the stop and start phases of a team restart
        FLEET_RESTART_PAUSE_MS: u64 = 2000;
        /// Prefix of pre-provisioned container names
        FLEET_CONTAINER_PREFIX: &str = "fleet";
        /// Seconds Docker waits before killing a stopping container
        FLEET_STOP_TIMEOUT_SECS: i64 = 10;
        /// Connect to Docker for container mechanisms
        FLEET_ENABLE_CONTAINERS: bool = true;
        /// Start teams marked auto_deploy on startup
        FLEET_AUTO_DEPLOY: bool = true;
        /// Capability server files (comma-separated, later wins). Appended after the defaults.
        FLEET_MCP_SERVER_FILES: &str = "";
        /// Tool descriptor cache TTL
        FLEET_TOOLS_CACHE_TTL_SECS: u64 = 300;
        /// Per-phase timeout of a capability server session
        FLEET_TOOLS_SESSION_TIMEOUT_MS: u64 = 10000;
        /// OpenAI-compatible endpoint for the ask tool
        FLEET_LLM_BASE_URL: &str = "https://api.openai.com/v1";
        FLEET_LLM_MODEL: &str = "gpt-4o-mini";
        /// Name of the env var holding the LLM API key
        FLEET_LLM_API_KEY_ENV: &str = "OPENAI_API_KEY";
        /// Iteration cap of the conversational loop
        FLEET_LLM_MAX_ITERATIONS: usize = 3;
    }

    let workspace_dir = if !(*WORKSPACE_DIR).is_empty() {
        PathBuf::from((*WORKSPACE_DIR).to_string())
    } else {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    };
    let fleet_home = resolve_fleet_home(&workspace_dir);

    // Config loads before tracing so [logging] can shape it; errors are reported after.
    let (user_cfg, cfg_error) = match load_user_config(&fleet_home) {
        Ok(cfg) => (cfg, None),
        Err(e) => (None, Some(e)),
    };
    init_tracing(&fleet_home, user_cfg.as_ref());
    if let Some(e) = cfg_error {
        tracing::warn!("ignoring unreadable config.toml: {:#}", e);
    }

    tracing::info!("starting fleet-mcp (transport={})", *TRANSPORT);
    tracing::info!("workspace_dir={}", workspace_dir.display());
    tracing::info!("fleet_home={}", fleet_home.display());

    // env wins, else config, else defaults
    let env_set = |k: &str| std::env::var_os(k).is_some();
    let fleet_cfg = user_cfg.as_ref().and_then(|c| c.fleet.as_ref());
    let tools_cfg = user_cfg.as_ref().and_then(|c| c.tools.as_ref());
    let llm_cfg = user_cfg.as_ref().and_then(|c| c.llm.as_ref());

    let mut settings = FleetSettings::defaults(&fleet_home, &workspace_dir);

    if env_set("FLEET_TEMPLATE_FILES") {
        settings.template_files.extend(split_paths(*FLEET_TEMPLATE_FILES));
    } else if let Some(files) = fleet_cfg.and_then(|f| f.template_files.as_ref()) {
        settings
            .template_files
            .extend(files.iter().map(|p| expand_home(p)));
    }
    if env_set("FLEET_TEAMS_FILE") && !(*FLEET_TEAMS_FILE).is_empty() {
        settings.teams_file = Some(expand_home(*FLEET_TEAMS_FILE));
    } else if let Some(path) = fleet_cfg.and_then(|f| f.teams_file.as_ref()) {
        settings.teams_file = Some(expand_home(path));
    }
    let ms = |key: &str, env_val: u64, cfg_val: Option<u64>| {
        let v = if env_set(key) {
            env_val
        } else {
            cfg_val.unwrap_or(env_val)
        };
        Duration::from_millis(v)
    };
    settings.grace = ms("FLEET_GRACE_MS", *FLEET_GRACE_MS, fleet_cfg.and_then(|f| f.grace_ms));
    settings.settle = ms(
        "FLEET_SETTLE_MS",
        *FLEET_SETTLE_MS,
        fleet_cfg.and_then(|f| f.settle_ms),
    );
    settings.restart_pause = ms(
        "FLEET_RESTART_PAUSE_MS",
        *FLEET_RESTART_PAUSE_MS,
        fleet_cfg.and_then(|f| f.restart_pause_ms),
    );
    settings.container_prefix = if env_set("FLEET_CONTAINER_PREFIX") {
        (*FLEET_CONTAINER_PREFIX).to_string()
    } else {
        fleet_cfg
            .and_then(|f| f.container_prefix.clone())
            .unwrap_or_else(|| (*FLEET_CONTAINER_PREFIX).to_string())
    };
    settings.stop_timeout_secs = if env_set("FLEET_STOP_TIMEOUT_SECS") {
        *FLEET_STOP_TIMEOUT_SECS
    } else {
        fleet_cfg
            .and_then(|f| f.stop_timeout_secs)
            .unwrap_or(*FLEET_STOP_TIMEOUT_SECS)
    };
    settings.enable_containers = *FLEET_ENABLE_CONTAINERS;

    if env_set("FLEET_MCP_SERVER_FILES") {
        settings
            .server_files
            .extend(split_paths(*FLEET_MCP_SERVER_FILES));
    } else if let Some(files) = tools_cfg.and_then(|t| t.server_files.as_ref()) {
        for p in files {
            let pb = expand_home(p);
            if !settings.server_files.contains(&pb) {
                settings.server_files.push(pb);
            }
        }
    }
    settings.cache_ttl = if env_set("FLEET_TOOLS_CACHE_TTL_SECS") {
        Duration::from_secs(*FLEET_TOOLS_CACHE_TTL_SECS)
    } else {
        Duration::from_secs(
            tools_cfg
                .and_then(|t| t.cache_ttl_secs)
                .unwrap_or(*FLEET_TOOLS_CACHE_TTL_SECS),
        )
    };
    settings.session_timeout = ms(
        "FLEET_TOOLS_SESSION_TIMEOUT_MS",
        *FLEET_TOOLS_SESSION_TIMEOUT_MS,
        tools_cfg.and_then(|t| t.session_timeout_ms),
    );

    let pick_str = |key: &str, env_val: &str, cfg_val: Option<&String>| -> String {
        if env_set(key) {
            env_val.to_string()
        } else {
            cfg_val.cloned().unwrap_or_else(|| env_val.to_string())
        }
    };
    settings.llm.base_url = pick_str(
        "FLEET_LLM_BASE_URL",
        *FLEET_LLM_BASE_URL,
        llm_cfg.and_then(|l| l.base_url.as_ref()),
    );
    settings.llm.model = pick_str(
        "FLEET_LLM_MODEL",
        *FLEET_LLM_MODEL,
        llm_cfg.and_then(|l| l.model.as_ref()),
    );
    settings.llm.api_key_env = pick_str(
        "FLEET_LLM_API_KEY_ENV",
        *FLEET_LLM_API_KEY_ENV,
        llm_cfg.and_then(|l| l.api_key_env.as_ref()),
    );
    settings.llm.max_iterations = if env_set("FLEET_LLM_MAX_ITERATIONS") {
        *FLEET_LLM_MAX_ITERATIONS
    } else {
        llm_cfg
            .and_then(|l| l.max_iterations)
            .unwrap_or(*FLEET_LLM_MAX_ITERATIONS)
    };
    settings.llm.system_prompt = llm_cfg.and_then(|l| l.system_prompt.clone());

    tracing::debug!(
        "template files: {}",
        settings
            .template_files
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    tracing::debug!(
        "capability server files: {}",
        settings
            .server_files
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let fleet = match Fleet::build(&settings) {
        Ok(f) => Arc::new(f),
        Err(e) => {
            tracing::error!("failed to assemble fleet: {:#}", e);
            std::process::exit(1);
        }
    };

    if *FLEET_AUTO_DEPLOY {
        let teams = fleet.teams.clone();
        tokio::spawn(async move {
            for result in teams.auto_deploy().await {
                tracing::info!(
                    team = %result.team_name,
                    started = result.started_count,
                    total = result.total_count,
                    "auto-deploy: {}",
                    result.message
                );
            }
        });
    }

    let server_details = InitializeResult {
        server_info: Implementation {
            name: "fleet-mcp".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("Fleet MCP Server".to_string()),
        },
        capabilities: ServerCapabilities {
            tools: Some(ServerCapabilitiesTools { list_changed: None }),
            ..Default::default()
        },
        meta: None,
        instructions: Some(
            "Deploy agents with deploy_agent, manage groups with the *_team tools, and use ask \
             for natural-language requests over the capability servers."
                .to_string(),
        ),
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
    };

    let handler = FleetServerHandler::new(fleet);

    if *TRANSPORT == "stdio" {
        let transport = StdioTransport::new(TransportOptions::default())?;
        let server: ServerRuntime =
            server_runtime_core::create_server(server_details, transport, handler);
        tracing::info!("starting stdio server");
        if let Err(e) = server.start().await {
            let msg = match e.rpc_error_message() {
                Some(m) => m.to_string(),
                None => e.to_string(),
            };
            tracing::error!("server runtime error: {}", msg);
        }
    } else {
        let host = (*HOST).to_string();
        let port = *PORT;
        let ping = Duration::from_secs(*PING_SECS);
        let server = hyper_server_core::create_server(
            server_details,
            handler,
            HyperServerOptions {
                host: host.clone(),
                port,
                ping_interval: ping,
                enable_json_response: Some(*HTTP_JSON),
                ..Default::default()
            },
        );
        tracing::info!(
            "http server configured; starting listener on {}:{} (json={}, ping_secs={})",
            host,
            port,
            *HTTP_JSON,
            *PING_SECS
        );
        if let Err(e) = server.start().await {
            let msg = match e.rpc_error_message() {
                Some(m) => m.to_string(),
                None => e.to_string(),
            };
            tracing::error!("hyper server error: {}", msg);
        }
    }
    tracing::info!("server stopped");
    Ok(())
}
