use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use clap::Parser;
use env_logger::Env;
use log::info;

use pinroute::adapters::SystemShell;
use pinroute::web_handlers::{interfaces, AppState};

/// Selective domain/service routing through a proxy tunnel
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0")]
    address: String,

    /// Listen port
    #[arg(short, long, default_value_t = 8088)]
    port: u16,

    /// Directory holding the JSON documents
    #[arg(short, long, default_value = "/etc/pinroute", value_name = "DIR")]
    data_dir: PathBuf,

    /// Path the tunnel engine reads its configuration from
    #[arg(long, default_value = "/etc/sing-box/config.json", value_name = "FILE")]
    engine_config: PathBuf,

    /// Resolver directives file for domain watching
    #[arg(
        long,
        default_value = "/tmp/dnsmasq.d/pinroute.conf",
        value_name = "FILE"
    )]
    resolver_conf: PathBuf,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(Env::default().default_filter_or("info"));

    let args = Args::parse();

    let state = AppState::build(
        &args.data_dir,
        args.engine_config,
        args.resolver_conf,
        Arc::new(SystemShell),
    )?;

    let bind = format!("{}:{}", args.address, args.port);
    info!("listening on {}", bind);

    let app_state = web::Data::new(state);
    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .configure(interfaces::config)
    })
    .bind(bind)?
    .run()
    .await?;
    Ok(())
}
