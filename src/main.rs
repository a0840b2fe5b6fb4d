use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use flow_auth::error::{protocol_error, Error, ProtocolErrorKind};
use flow_auth::oauth::{AuthorizationRequestContext, FlowVariant, ResponseType};
use flow_auth::polling::{Coordinator, GrantPoll, PollSource, PollState, Pollable};
use flow_auth::token::{ExchangeOutcome, Grant, TokenEndpoint, TokenSet};
use log::{error, info, warn};
use secrecy::ExposeSecret;
use service::{config::Config, logging::Logger, AppState};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(author, version, about = "Drive OAuth 2.0 / OpenID Connect flows from the terminal")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build an authorization URL, then paste the callback URL to finish.
    Authorize {
        #[arg(long, value_enum, default_value_t = RedirectFlow::Code)]
        flow: RedirectFlow,
    },
    /// Device authorization grant.
    Device,
    /// Client-initiated backchannel authentication.
    Ciba {
        #[arg(long)]
        login_hint: String,
        #[arg(long)]
        binding_message: Option<String>,
    },
    /// Redirectless (pi.flow) authorization.
    Redirectless {
        #[arg(long)]
        login_hint: Option<String>,
    },
    /// Client credentials token, served from the cache while fresh.
    WorkerToken,
    /// Cached tokens for a flow, refreshed when due.
    Tokens {
        #[arg(long)]
        key: String,
    },
    /// Revoke and forget the cached tokens for a flow.
    Revoke {
        #[arg(long)]
        key: String,
    },
    /// Move entries from the legacy store into the unified store.
    Migrate,
}

#[derive(Clone, Copy, ValueEnum)]
enum RedirectFlow {
    Code,
    Implicit,
    Hybrid,
}

impl RedirectFlow {
    fn variant(self) -> FlowVariant {
        match self {
            RedirectFlow::Code => FlowVariant::AuthorizationCode,
            RedirectFlow::Implicit => FlowVariant::Implicit {
                response_type: ResponseType::IdTokenToken,
            },
            RedirectFlow::Hybrid => FlowVariant::Hybrid {
                response_type: ResponseType::CodeIdToken,
            },
        }
    }

    fn cache_key(self) -> &'static str {
        match self {
            RedirectFlow::Code => "authorization_code",
            RedirectFlow::Implicit => "implicit",
            RedirectFlow::Hybrid => "hybrid",
        }
    }
}

#[tokio::main]
async fn main() {
    service::config::load_dotenv();
    let cli = Cli::parse();
    if let Err(e) = Logger::init_logger(&cli.config) {
        eprintln!("Failed to start logger: {e}");
    }

    let state = match AppState::new(cli.config).await {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to initialize: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&state, cli.command).await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(state: &AppState, command: Command) -> Result<(), Error> {
    match command {
        Command::Authorize { flow } => authorize(state, flow).await,
        Command::Device => {
            let ctx = context(state, FlowVariant::DeviceCode)?;
            let handle = state.builder.start_device(&ctx).await?;
            println!(
                "Visit {} and enter code {}",
                handle
                    .verification_uri_complete
                    .as_deref()
                    .unwrap_or(&handle.verification_uri),
                handle.user_code
            );
            poll_and_store(state, &handle, "device").await
        }
        Command::Ciba {
            login_hint,
            binding_message,
        } => {
            let flow = FlowVariant::Ciba {
                login_hint,
                binding_message,
            };
            let handle = state.builder.start_ciba(&context(state, flow)?).await?;
            println!("Waiting for the user to approve on their device...");
            poll_and_store(state, &handle, "ciba").await
        }
        Command::Redirectless { login_hint } => {
            let mut ctx = context(
                state,
                FlowVariant::Redirectless {
                    response_type: ResponseType::Code,
                },
            )?;
            ctx.login_hint = login_hint;
            let start = state.builder.start_redirectless(&ctx).await?;
            println!(
                "Flow {} started ({}); complete it to continue",
                start.handle.flow_id, start.handle.status
            );
            poll_and_store(state, &start, "redirectless").await
        }
        Command::WorkerToken => {
            let tokens = state.worker_token().await?;
            print_tokens(&tokens);
            Ok(())
        }
        Command::Tokens { key } => {
            let tokens = state.tokens(&key).await?;
            print_tokens(&tokens);
            Ok(())
        }
        Command::Revoke { key } => {
            if let Some(record) = state.cache.peek(&key).await? {
                let token = &record.token;
                match token.refresh_token_str() {
                    Some(refresh) => state.exchanger.revoke(refresh, Some("refresh_token")).await?,
                    None => {
                        state
                            .exchanger
                            .revoke(token.access_token.expose_secret(), Some("access_token"))
                            .await?
                    }
                }
            }
            state.cache.remove(&key).await?;
            info!("Removed cached tokens for {}", key);
            Ok(())
        }
        Command::Migrate => {
            let report = state.flows.guard().ensure_migration().await?;
            println!(
                "Migrated {} entries, kept {} existing",
                report.migrated, report.kept_existing
            );
            Ok(())
        }
    }
}

fn context(state: &AppState, flow: FlowVariant) -> Result<AuthorizationRequestContext, Error> {
    let config = &state.config;
    let mut ctx = AuthorizationRequestContext::new(config.environment_id()?, config.client()?, flow);
    ctx.redirect_uri = config.redirect_uri.clone();
    ctx.scopes = config.scopes.clone();
    Ok(ctx)
}

async fn authorize(state: &AppState, flow: RedirectFlow) -> Result<(), Error> {
    let request = state.builder.build(&context(state, flow.variant())?)?;
    if let Some(pkce) = &request.pkce {
        state.flows.save_pkce(&request.state, &pkce.verifier).await?;
    }
    println!("Open this URL in a browser:\n\n{}\n", request.url);
    println!("Paste the full callback URL:");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let line = lines.next_line().await?.unwrap_or_default();
    let callback = url::Url::parse(line.trim()).map_err(|e| Error {
        source: Some(Box::new(e)),
        error_kind: flow_auth::ErrorKind::Protocol(ProtocolErrorKind::MalformedResponse),
    })?;

    let (params, attempt) = state.states.resolve_callback(&callback)?;
    let verifier = state.flows.take_pkce(&params.state).await?;

    let tokens = match params.code {
        Some(code) => {
            let grant = Grant::AuthorizationCode {
                code,
                code_verifier: verifier.or(attempt.pkce_verifier),
                redirect_uri: attempt.redirect_uri.unwrap_or_default(),
            };
            outcome_tokens(state.exchanger.exchange(grant).await?)?
        }
        None => {
            let access_token = params.access_token.ok_or_else(|| {
                protocol_error(
                    ProtocolErrorKind::MissingField("access_token"),
                    "callback carried neither a code nor an access token",
                )
            })?;
            let mut tokens = TokenSet::new(&access_token, params.expires_in, Utc::now());
            if let Some(id_token) = params.id_token {
                tokens = tokens.with_id_token(&id_token);
            }
            tokens.scope = params.scope;
            tokens
        }
    };

    state.cache.set(flow.cache_key(), tokens.clone()).await?;
    print_tokens(&tokens);
    Ok(())
}

async fn poll_and_store<H: Pollable>(state: &AppState, handle: &H, key: &str) -> Result<(), Error> {
    let (grant, schedule) = handle.poll_plan(Utc::now());
    let source = GrantPoll::new(state.exchanger.clone(), grant);
    let report = poll_until_done(&state.coordinator(), &source, schedule).await?;
    info!(
        "Polling ended as {:?} after {} attempts",
        report.state, report.attempts
    );
    if report.state != PollState::Authorized {
        warn!("No tokens issued for {}", key);
    }

    let tokens = report.into_tokens()?;
    state.cache.set(key, tokens.clone()).await?;
    print_tokens(&tokens);
    Ok(())
}

/// Polls until a terminal state, cancelling on Ctrl-C.
async fn poll_until_done(
    coordinator: &Coordinator,
    source: &dyn PollSource,
    schedule: flow_auth::polling::PollSchedule,
) -> Result<flow_auth::polling::PollReport, Error> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let report = coordinator.run(source, schedule, &cancel).await;
    watcher.abort();
    report
}

fn outcome_tokens(outcome: ExchangeOutcome) -> Result<TokenSet, Error> {
    if let ExchangeOutcome::PasswordChangeRequired(change) = &outcome {
        warn!(
            "Password change required{}",
            change
                .flow_id
                .as_deref()
                .map(|id| format!(" for flow {id}"))
                .unwrap_or_default()
        );
    }
    outcome.into_tokens()
}

fn print_tokens(tokens: &TokenSet) {
    println!("token_type: {}", tokens.token_type);
    println!("access_token: {}", tokens.access_token.expose_secret());
    if let Some(expires_at) = tokens.expires_at {
        println!("expires_at: {}", expires_at.to_rfc3339());
    }
    if let Some(scope) = &tokens.scope {
        println!("scope: {scope}");
    }
    println!("refresh_token: {}", if tokens.refresh_token.is_some() { "yes" } else { "no" });
    println!("id_token: {}", if tokens.id_token.is_some() { "yes" } else { "no" });
}
