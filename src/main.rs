use anyhow::{Context, Result};
use clap::{App, Arg};
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;

use vcl_edge::client::HttpClient;
use vcl_edge::config::Settings;
use vcl_edge::health::HealthChecker;
use vcl_edge::pipeline::{Pipeline, PipelineSettings};
use vcl_edge::{parser, scanner, server, Vcl};

static INPUT_STR: &str = "INPUT";
static SHOW_TOKENS_STR: &str = "show tokens";
static SHOW_AST_STR: &str = "show ast";
static SYNTAX_CHECK: &str = "check syntax";
static PORT_STR: &str = "port";
static CONFIG_STR: &str = "config";
static MAX_RESTARTS_STR: &str = "max restarts";

#[tokio::main]
async fn main() -> Result<()> {
    let matches = App::new("vcl-edge")
        .version("0.1.0")
        .about("serves HTTP through a VCL program")
        .arg(
            Arg::with_name(INPUT_STR)
                .help("sets input file to use")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name(SHOW_TOKENS_STR)
                .long("show-tokens")
                .takes_value(false)
                .help("show the token stream"),
        )
        .arg(
            Arg::with_name(SHOW_AST_STR)
                .long("show-ast")
                .takes_value(false)
                .help("show the AST"),
        )
        .arg(
            Arg::with_name(SYNTAX_CHECK)
                .long("syntax-check")
                .takes_value(false)
                .help("check the syntax can be parsed"),
        )
        .arg(
            Arg::with_name(PORT_STR)
                .long("port")
                .takes_value(true)
                .help("port to listen on"),
        )
        .arg(
            Arg::with_name(CONFIG_STR)
                .long("config")
                .takes_value(true)
                .help("TOML settings file"),
        )
        .arg(
            Arg::with_name(MAX_RESTARTS_STR)
                .long("max-restarts")
                .takes_value(true)
                .help("restarts allowed per request"),
        )
        .get_matches();

    let input_file = matches
        .value_of(INPUT_STR)
        .context("no input file given")?;
    let input = fs::read_to_string(input_file)
        .with_context(|| format!("could not read {}", input_file))?;

    let tokens = scanner::scan_tokens(&input);
    if matches.is_present(SHOW_TOKENS_STR) {
        println!("tokens: {:#?}", tokens);
        return Ok(());
    }

    let program = parser::parse(tokens).with_context(|| format!("parse error in {}", input_file))?;
    if matches.is_present(SYNTAX_CHECK) {
        println!("successfully parsed");
        return Ok(());
    }
    if matches.is_present(SHOW_AST_STR) {
        println!("AST: {:#?}", program);
        return Ok(());
    }

    let vcl = Vcl::from_program(&program)?;

    let mut settings = Settings::load(matches.value_of(CONFIG_STR).map(Path::new))?;
    if let Some(port) = matches.value_of(PORT_STR) {
        settings.port = port
            .parse()
            .with_context(|| format!("invalid port {:?}", port))?;
    }
    if let Some(n) = matches.value_of(MAX_RESTARTS_STR) {
        settings.max_restarts = n
            .parse()
            .with_context(|| format!("invalid restart limit {:?}", n))?;
    }

    run(vcl, settings).await
}

async fn run(vcl: Vcl, settings: Settings) -> Result<()> {
    let addr: SocketAddr = settings
        .address()
        .to_socket_addrs()
        .with_context(|| format!("invalid listen address {}", settings.address()))?
        .next()
        .with_context(|| format!("{} did not resolve", settings.address()))?;

    let client = Arc::new(HttpClient::new());
    let pipeline = Arc::new(Pipeline::new(
        vcl.program,
        Arc::clone(&vcl.registry),
        client.clone(),
        PipelineSettings::from(&settings),
    ));

    if settings.health_checks {
        HealthChecker::new(vcl.registry, client).spawn(pipeline.subscribe());
    }

    let shutdown = {
        let pipeline = Arc::clone(&pipeline);
        async move {
            server::ctrl_c().await;
            eprintln!("shutting down");
            pipeline.shutdown();
        }
    };
    server::serve(pipeline, addr, shutdown).await?;
    Ok(())
}
