use anyhow::{Context, bail};
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use serde::Serialize;
use serde_json::{Map, Value};
use std::{
    io::{Write, stdout},
    time::Duration,
};
use streamerbot::{
    ActionRef, ClientOptions, EventHandlers, Request, Scheme, StreamerbotClient, Timeouts,
};
use tracing_subscriber::EnvFilter;

fn parse_json_object(s: &str) -> serde_json::Result<Map<String, Value>> {
    serde_json::from_str(s)
}

fn command() -> Command {
    clap::command!()
        .arg(
            Arg::new("host")
                .value_name("HOST")
                .long("host")
                .short('a')
                .env("STREAMERBOT_HOST")
                .default_value("127.0.0.1")
                .help("Streamer.bot WebSocket server host."),
        )
        .arg(
            Arg::new("port")
                .value_name("PORT")
                .long("port")
                .short('p')
                .env("STREAMERBOT_PORT")
                .default_value("8080")
                .value_parser(value_parser!(u16))
                .help("Streamer.bot WebSocket server port."),
        )
        .arg(
            Arg::new("password")
                .value_name("PASSWORD")
                .long("password")
                .short('s')
                .env("STREAMERBOT_PASSWORD")
                .hide_env_values(true)
                .help("Streamer.bot WebSocket server password."),
        )
        .arg(
            Arg::new("endpoint")
                .value_name("PATH")
                .long("endpoint")
                .default_value("/")
                .help("Path of the WebSocket endpoint."),
        )
        .arg(
            Arg::new("scheme")
                .value_name("SCHEME")
                .long("scheme")
                .env("STREAMERBOT_SCHEME")
                .default_value("ws")
                .value_parser(["ws", "wss"])
                .help("ws, or wss (needs the tls feature)."),
        )
        .arg(
            Arg::new("timeout")
                .value_name("MILLIS")
                .long("timeout")
                .default_value("5000")
                .value_parser(value_parser!(u64))
                .help("Request timeout in milliseconds."),
        )
        .arg(
            Arg::new("compact")
                .long("compact")
                .short('c')
                .action(ArgAction::SetTrue)
                .help("Compact JSON output"),
        )
        .subcommand_required(true)
        .subcommand(Command::new("info").about("Print information about the instance"))
        .subcommand(
            Command::new("request")
                .about("Send a request and wait for a response")
                .arg(
                    Arg::new("kind")
                        .value_name("KIND")
                        .required(true)
                        .help("Request name, e.g. GetActions."),
                )
                .arg(
                    Arg::new("data")
                        .value_name("DATA")
                        .help("JSON object merged into the request.")
                        .value_parser(parse_json_object),
                ),
        )
        .subcommand(
            Command::new("action")
                .about("Run an action")
                .arg(
                    Arg::new("action")
                        .value_name("ACTION")
                        .required(true)
                        .help("Action id, or name with --by-name."),
                )
                .arg(
                    Arg::new("args")
                        .value_name("ARGS")
                        .help("JSON object of action arguments.")
                        .value_parser(parse_json_object),
                )
                .arg(
                    Arg::new("by-name")
                        .long("by-name")
                        .short('n')
                        .action(ArgAction::SetTrue)
                        .help("Look the action up by name instead of id"),
                )
                .arg(
                    Arg::new("wait-response")
                        .long("wait-response")
                        .short('w')
                        .action(ArgAction::SetTrue)
                        .help("Wait for the action to answer with a custom event"),
                ),
        )
        .subcommand(
            Command::new("events").about("Listen for events").arg(
                Arg::new("patterns")
                    .value_name("PATTERN")
                    .num_args(0..)
                    .default_value("*")
                    .help("Event patterns: *, Source.* or Source.Type"),
            ),
        )
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("STREAMERBOT_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    let matches = command().get_matches();
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(run(matches))
}

async fn run(matches: ArgMatches) -> anyhow::Result<()> {
    let pretty = !matches.get_flag("compact");
    let client = connect(&matches).await?;
    match matches.subcommand() {
        Some(("info", _)) => {
            let info = client.get_info().await?;
            json_print(pretty, &info)?;
        }
        Some(("request", sub_matches)) => {
            let kind = sub_matches
                .get_one::<String>("kind")
                .context("missing request kind")?;
            let mut request = Request::new(kind.as_str());
            if let Some(data) = sub_matches.get_one::<Map<String, Value>>("data") {
                request.params.extend(data.clone());
            }
            let response = client.request(request).await?;
            json_print(pretty, &response)?;
        }
        Some(("action", sub_matches)) => {
            let action = sub_matches
                .get_one::<String>("action")
                .context("missing action")?;
            let action = if sub_matches.get_flag("by-name") {
                ActionRef::name(action.as_str())
            } else {
                ActionRef::id(action.as_str())
            };
            let args = sub_matches.get_one::<Map<String, Value>>("args").cloned();
            if sub_matches.get_flag("wait-response") {
                let answer = client.do_action_with_response(action, args, None).await?;
                json_print(pretty, &answer)?;
            } else {
                let response = client.do_action(action, args).await?;
                json_print(pretty, &response)?;
            }
        }
        Some(("events", sub_matches)) => {
            let patterns: Vec<String> = sub_matches
                .get_many::<String>("patterns")
                .map(|patterns| patterns.cloned().collect())
                .unwrap_or_default();
            client
                .on(patterns, move |event| {
                    if let Err(err) = json_print(pretty, event) {
                        eprintln!("Error: {err}");
                    }
                })
                .await?;
            tokio::signal::ctrl_c().await?;
        }
        _ => unreachable!(),
    }
    if let Err(err) = client.disconnect().await {
        tracing::debug!(error = %err, "disconnect was not acknowledged");
    }
    Ok(())
}

async fn connect(matches: &ArgMatches) -> anyhow::Result<StreamerbotClient> {
    let Some(host) = matches.get_one::<String>("host") else {
        bail!("no host given");
    };
    let scheme = match matches.get_one::<String>("scheme").map(String::as_str) {
        Some("wss") => Scheme::Wss,
        _ => Scheme::Ws,
    };
    let request_timeout = matches.get_one::<u64>("timeout").copied().unwrap_or(5000);
    let options = ClientOptions {
        scheme,
        host: host.clone(),
        port: matches.get_one::<u16>("port").copied().unwrap_or(8080),
        endpoint: matches
            .get_one::<String>("endpoint")
            .cloned()
            .unwrap_or_default(),
        password: matches.get_one::<String>("password").cloned(),
        immediate: false,
        // A CLI invocation either works or exits.
        auto_reconnect: matches.subcommand_name() == Some("events"),
        timeouts: Timeouts {
            request: Duration::from_millis(request_timeout),
            ..Default::default()
        },
        ..Default::default()
    };
    let url = options.url();
    let client = StreamerbotClient::builder()
        .options(options)
        .handlers(EventHandlers::new().on_disconnect(|| eprintln!("Disconnected")))
        .build();
    client
        .connect()
        .await
        .with_context(|| format!("could not connect to {url}"))?;
    Ok(client)
}

fn json_print<T: Serialize>(pretty: bool, data: &T) -> anyhow::Result<()> {
    let mut out = stdout().lock();
    json_serialize(pretty, data, &mut out)?;
    writeln!(out)?;
    Ok(())
}

fn json_serialize<T: Serialize, W: Write>(
    pretty: bool,
    data: &T,
    writer: W,
) -> Result<(), serde_json::Error> {
    if pretty {
        data.serialize(&mut serde_json::Serializer::pretty(writer))
    } else {
        data.serialize(&mut serde_json::Serializer::new(writer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_is_well_formed() {
        command().debug_assert();
    }

    #[test]
    fn events_default_to_everything() {
        let matches = command().get_matches_from(["streamerbot", "events"]);
        let (_, sub) = matches.subcommand().unwrap();
        let patterns: Vec<&String> = sub.get_many("patterns").unwrap().collect();
        assert_eq!(patterns, ["*"]);
    }

    fn parses(args: &[&str]) -> bool {
        command().try_get_matches_from(args).is_ok()
    }

    #[test]
    fn request_data_must_be_an_object() {
        assert!(parses(&["streamerbot", "request", "GetGlobal", r#"{"variable":"x"}"#]));
        assert!(!parses(&["streamerbot", "request", "GetGlobal", "[1,2]"]));
        assert!(!parses(&["streamerbot", "action"]));
    }

    #[test]
    fn compact_output() {
        let mut out = Vec::new();
        json_serialize(false, &serde_json::json!({ "a": [1] }), &mut out).unwrap();
        assert_eq!(out, br#"{"a":[1]}"#);
    }
}
