use actix_web::web::{Data, Json, Path};
use actix_web::{delete, get, post, web, App, HttpResponse, HttpServer, Responder};
use clap::Parser;
use rs_zap_pos::config::Config;
use rs_zap_pos::order::lnurl::Destination;
use rs_zap_pos::order::order_flow::OrderFlow;
use rs_zap_pos::websocket::ws_relay::WsRelay;
use rs_zap_pos::zap::zap_correlator::{CorrelatorConfig, ZapOrder};
use rs_zap_pos::{check_event, EventData, KeyStore, Relay, RelaySet, ZapCorrelator, ZapError};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

struct AppState {
    keys: Arc<KeyStore>,
    relays: Arc<RelaySet>,
    flow: Mutex<OrderFlow>,
}

fn error_response(error: &ZapError) -> HttpResponse {
    let body = json!({ "error": error.to_string(), "retry": error.is_user_facing() });
    match error {
        ZapError::IdentityUnavailable | ZapError::Storage(_) => {
            HttpResponse::ServiceUnavailable().json(body)
        }
        ZapError::Network(_) => HttpResponse::BadGateway().json(body),
        _ => HttpResponse::BadRequest().json(body),
    }
}

#[get("/identity")]
async fn identity(state: Data<AppState>) -> impl Responder {
    match state.keys.public_key() {
        Ok(public_key) => HttpResponse::Ok().json(json!({
            "public_key": public_key,
            "persistent": state.keys.is_persistent(),
            "relays": state.relays.urls(),
        })),
        Err(e) => error_response(&e),
    }
}

#[post("/orders")]
async fn create_order(state: Data<AppState>, req_body: Json<ZapOrder>) -> impl Responder {
    let order = req_body.into_inner();
    let mut flow = state.flow.lock().await;
    flow.set_destination(Destination {
        recipient_pubkey: order.recipient_pubkey,
        destination: order.destination,
    });
    flow.set_amount(order.amount_msat);

    match flow.transfer(order.back_reference).await {
        Ok(pending) => {
            let publish = pending.publish_outcome();
            if let Some(e) = publish.error() {
                warn!("order {}: {e}", pending.request_id());
            }
            HttpResponse::Accepted().json(json!({
                "request_id": pending.request_id(),
                "publish": publish,
                "state": pending.state(),
            }))
        }
        Err(e) => error_response(&e),
    }
}

#[get("/orders/current")]
async fn current_order(state: Data<AppState>) -> impl Responder {
    let flow = state.flow.lock().await;
    HttpResponse::Ok().json(json!({
        "request_id": flow.pending().map(|pending| pending.request_id()),
        "amount_msat": flow.amount_msat(),
        "destination": flow.destination(),
        "state": flow.state(),
    }))
}

#[delete("/orders/current")]
async fn clear_order(state: Data<AppState>) -> impl Responder {
    state.flow.lock().await.clear().await;
    HttpResponse::NoContent().finish()
}

#[get("/events/{id}")]
async fn get_event(state: Data<AppState>, id: Path<String>) -> impl Responder {
    match state.relays.fetch_event(&id, FETCH_TIMEOUT).await {
        Some(event) => HttpResponse::Ok().json(event),
        None => HttpResponse::NotFound().body("Event not found"),
    }
}

#[post("/events/verify")]
async fn verify_event(req_body: Json<EventData>) -> impl Responder {
    let event_data = req_body.into_inner();
    if let Err(e) = check_event(&event_data) {
        info!("rejected event {}: {e}", event_data.id);
        return HttpResponse::BadRequest().body("Invalid signature");
    }
    HttpResponse::Ok().body("Event verified")
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let config = Config::parse();

    let keys = Arc::new(KeyStore::open(&config.key_file));
    if let Err(e) = keys.get_or_create_private_key() {
        warn!("signing key unavailable: {e}");
    }

    let endpoints = config
        .relay_urls()
        .into_iter()
        .map(|url| {
            let relay = WsRelay::new(url).with_connect_timeout(config.relay_timeout());
            Arc::new(relay) as Arc<dyn Relay>
        })
        .collect();
    let relays = Arc::new(RelaySet::new(endpoints, config.relay_timeout()));
    relays.connect().await;

    let correlator = ZapCorrelator::new(
        relays.clone(),
        keys.clone(),
        CorrelatorConfig {
            since: config.since,
            receipt_deadline: config.receipt_deadline(),
        },
    );
    let state = Data::new(AppState {
        keys,
        relays: relays.clone(),
        flow: Mutex::new(OrderFlow::new(Arc::new(correlator))),
    });

    info!("Server running at http://{}", config.bind);
    HttpServer::new(move || {
        App::new().app_data(state.clone()).service(
            web::scope("/api")
                .service(identity)
                .service(create_order)
                .service(current_order)
                .service(clear_order)
                .service(get_event)
                .service(verify_event),
        )
    })
    .bind(config.bind.as_str())?
    .run()
    .await?;

    relays.disconnect().await;
    Ok(())
}
