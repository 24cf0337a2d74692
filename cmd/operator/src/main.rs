use std::sync::Arc;

use actix_web::{
    get, middleware, post, web, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::{crate_authors, crate_description, crate_version, Parser};
use prometheus_client::registry::Registry;
use tokio::sync::mpsc;
use tracing::{error, info};

use nopea::config::Config;
use nopea::controller::{Controller, State};
use nopea::events::{EventIdGen, TracingSink};
use nopea::git::{GitClient, GitClientConfig};
use nopea::k8s::KubeApi;
use nopea::leader::{KubeLeases, LeaderElection};
use nopea::metrics::WebhookOutcomeLabel;
use nopea::store::StateStore;
use nopea::supervisor::Supervisor;
use nopea::telemetry;
use nopea::webhook::{self, Delivery, Outcome, Rejection};
use nopea::worker::WorkerDeps;
use nopea_k8s_util::new_client_with_metrics;

struct AppState {
    state: State,
    supervisor: Supervisor,
    webhook_secret: Option<String>,
}

#[get("/metrics")]
async fn metrics(c: web::Data<AppState>, _req: HttpRequest) -> impl Responder {
    match c.state.metrics_text() {
        Ok(body) => HttpResponse::Ok()
            .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
            .body(body),
        Err(e) => {
            error!("failed to encode metrics: {e:?}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/ready")]
async fn ready(c: web::Data<AppState>, _req: HttpRequest) -> impl Responder {
    if c.state.ready.is_ready() {
        HttpResponse::Ok().json("ready")
    } else {
        HttpResponse::ServiceUnavailable().json("not ready")
    }
}

fn header<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

#[post("/webhook/{repo}")]
async fn webhook_endpoint(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Bytes,
    c: web::Data<AppState>,
) -> impl Responder {
    let repo = path.into_inner();
    if !webhook::valid_repo_name(&repo) {
        return HttpResponse::BadRequest().json("invalid repository name");
    }

    let delivery = Delivery {
        github_event: header(&req, "X-GitHub-Event"),
        gitlab_event: header(&req, "X-GitLab-Event"),
        signature: header(&req, "X-Hub-Signature-256"),
        token: header(&req, "X-Gitlab-Token"),
        body: &body,
    };
    let provider = webhook::detect_provider(&delivery)
        .map(|p| p.as_str())
        .unwrap_or("unknown");
    let webhook_metrics = &c.state.metrics.webhook;

    match webhook::handle(&delivery, c.webhook_secret.as_deref()) {
        Ok(Outcome::Accepted(push)) => match c.supervisor.lookup(&repo) {
            Some(worker) => {
                info!(
                    %repo,
                    provider,
                    branch = push.branch.as_deref().unwrap_or_default(),
                    "webhook accepted"
                );
                worker.webhook(push.commit).await;
                webhook_metrics.inc(provider, WebhookOutcomeLabel::Accepted);
                HttpResponse::Ok().json("accepted")
            }
            None => {
                webhook_metrics.inc(provider, WebhookOutcomeLabel::Rejected);
                HttpResponse::NotFound().json("no such repository")
            }
        },
        Ok(Outcome::Ignored) => {
            webhook_metrics.inc(provider, WebhookOutcomeLabel::Ignored);
            HttpResponse::Ok().json("ignored")
        }
        Err(rejection) => {
            webhook_metrics.inc(provider, WebhookOutcomeLabel::Rejected);
            match rejection {
                Rejection::UnknownProvider | Rejection::InvalidPayload => {
                    HttpResponse::BadRequest().json(rejection.to_string())
                }
                Rejection::Unauthenticated => {
                    HttpResponse::Unauthorized().json(rejection.to_string())
                }
                Rejection::SecretNotConfigured => {
                    HttpResponse::InternalServerError().json(rejection.to_string())
                }
            }
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "nopea",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,nopea=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// URL for the OpenTelemetry tracing endpoint. Tracing is disabled
    /// when absent.
    #[arg(short, long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Ratio of traces to sample, `1.0` samples everything.
    #[arg(short, long, default_value_t = 0.1, env)]
    sample_ratio: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    telemetry::init(
        &args.log_filter,
        args.log_format,
        args.tracing_url.as_deref(),
        args.sample_ratio,
    )
    .await?;

    let config = Config::from_env();
    let use_leader_election = config.enable_leader_election && !config.cluster_enabled;

    let mut registry = Registry::default();
    let kube_config = kube::Config::infer().await?;
    let client = new_client_with_metrics(kube_config, &mut registry).await?;

    let state = State::new(registry, use_leader_election);
    let store = Arc::new(StateStore::new());

    let mut git_config = GitClientConfig::new(config.git_socket.clone());
    git_config.command = config.git_command.clone();
    let k8s = Arc::new(KubeApi::new(client.clone()));
    let deps = Arc::new(WorkerDeps {
        git: Arc::new(GitClient::new(git_config)),
        k8s: k8s.clone(),
        store: store.clone(),
        metrics: state.metrics.clone(),
        sink: Arc::new(TracingSink),
        ids: Arc::new(EventIdGen::new()),
        base_dir: config.repo_base_dir.clone(),
    });
    let supervisor = Supervisor::new(deps);

    let (leader_tx, leader_rx) = mpsc::channel(8);
    // in single-writer-off mode the sender stays alive so the controller
    // keeps running; it simply never receives an edge
    let _standalone_leadership = if use_leader_election {
        let leases = Arc::new(KubeLeases::new(client.clone(), &config.lease_namespace));
        tokio::spawn(LeaderElection::new(leases, config.leader_config(), leader_tx).run());
        None
    } else {
        if config.cluster_enabled {
            info!("cluster mode: leader election disabled, every node hosts workers");
        }
        Some(leader_tx)
    };

    let controller = Controller::new(k8s, supervisor.clone(), store, &state);
    let controller_task = tokio::spawn(controller.run(
        config.watch_namespace.clone(),
        use_leader_election,
        leader_rx,
    ));

    let app_state = web::Data::new(AppState {
        state: state.clone(),
        supervisor,
        webhook_secret: config.webhook_secret.clone(),
    });
    info!(port = config.http_port, namespace = %config.watch_namespace, "starting nopea");
    let server = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .wrap(
                middleware::Logger::default()
                    .exclude("/health")
                    .exclude("/ready"),
            )
            .service(health)
            .service(ready)
            .service(metrics)
            .service(webhook_endpoint)
    })
    .bind(("0.0.0.0", config.http_port))?
    .shutdown_timeout(5);

    // Both runtimes implement graceful shutdown, so poll until both are done
    let (_, served) = tokio::join!(controller_task, server.run());
    served?;
    Ok(())
}
