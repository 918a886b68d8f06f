use duallink_app::api;

/// The core is a library (spec §6: "Exit codes / CLI: Not applicable").
/// This binary only proves the external-interface shell links and starts —
/// a real product embeds `duallink-app::api` behind a UI or FFI boundary
/// rather than running it as a standalone process.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    api::init_logger();

    let os_name = std::env::consts::OS;
    let os_version = std::env::var("DUALLINK_OS_VERSION").unwrap_or_else(|_| "unknown".to_string());
    let config_dir = std::env::var("DUALLINK_CONFIG_DIR")
        .unwrap_or_else(|_| dirs_fallback_config_dir());

    api::init(os_name, &os_version, &config_dir);

    tracing::info!("duallink core shell ready; awaiting UI/FFI driven calls");
    Ok(())
}

/// `init`'s `config_dir` is normally supplied by the host UI/FFI layer
/// (spec §6); this binary target falls back to `$HOME/.config/duallink`
/// so it starts without extra setup.
fn dirs_fallback_config_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.config/duallink")
}
