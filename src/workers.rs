//! Built-in maritime workers and offline tools.
//!
//! The tools answer from static tables so the binary runs without network
//! access. Production deployments register HTTP-backed tools under the same
//! names.

use futures::future::BoxFuture;
use serde_json::{json, Value};

use keel_agent::{rank_candidates, Candidate, WorkerRegistry};
use keel_core::catalog::{Catalog, FallbackKind, ToolDefinition, WorkerDefinition};
use keel_core::config::ClassifierRule;
use keel_core::error::{KeelError, Result};
use keel_core::state::SharedState;
use keel_core::traits::{Tool, Worker, WorkerContext, WorkerOutput};
use keel_core::types::{is_marked_degraded, ToolOutcome};
use keel_core::workflow::{Condition, WorkflowDefinition, WorkflowStep};
use keel_tools::{great_circle_nm, ToolRegistry};

const SERVICE_SPEED_KNOTS: f64 = 12.5;
const DAILY_CONSUMPTION_MT: f64 = 32.0;
const SAFETY_MARGIN: f64 = 1.15;
/// Sailing distance over great-circle distance, on average.
const ROUTING_FACTOR: f64 = 1.18;

struct Port {
    code: &'static str,
    name: &'static str,
    lat: f64,
    lon: f64,
    vlsfo_usd_mt: f64,
}

const PORTS: &[Port] = &[
    Port { code: "NLRTM", name: "rotterdam", lat: 51.95, lon: 4.14, vlsfo_usd_mt: 548.0 },
    Port { code: "SGSIN", name: "singapore", lat: 1.26, lon: 103.84, vlsfo_usd_mt: 571.5 },
    Port { code: "AEFJR", name: "fujairah", lat: 25.12, lon: 56.35, vlsfo_usd_mt: 559.0 },
    Port { code: "GIGIB", name: "gibraltar", lat: 36.14, lon: -5.35, vlsfo_usd_mt: 589.0 },
    Port { code: "USHOU", name: "houston", lat: 29.73, lon: -95.27, vlsfo_usd_mt: 536.0 },
    Port { code: "CNSHA", name: "shanghai", lat: 31.23, lon: 121.47, vlsfo_usd_mt: 583.0 },
    Port { code: "BRSSZ", name: "santos", lat: -23.96, lon: -46.33, vlsfo_usd_mt: 602.0 },
];

fn port(code: &str) -> Option<&'static Port> {
    PORTS.iter().find(|p| p.code.eq_ignore_ascii_case(code))
}

fn port_point(code: &str) -> Value {
    match port(code) {
        Some(p) => json!({ "port": p.code, "lat": p.lat, "lon": p.lon }),
        None => json!({ "port": code }),
    }
}

/// Catalog used when the config file declares no workers.
pub fn default_catalog() -> Catalog {
    let workers = vec![
        WorkerDefinition::new("entity_extractor")
            .consumes(&["query"])
            .produces(&["vessel_imo", "origin_port", "destination_port"])
            .estimates(0.0005, 50),
        WorkerDefinition::new("route_agent")
            .consumes(&["origin_port", "destination_port"])
            .produces(&["route_data"])
            .tools(&["route_calculator"])
            .estimates(0.01, 1_500),
        WorkerDefinition::new("weather_agent")
            .consumes(&["route_data"])
            .produces(&["weather_forecast"])
            .tools(&["weather_api"])
            .parallel()
            .estimates(0.005, 800),
        WorkerDefinition::new("bunker_agent")
            .consumes(&["route_data"])
            .produces(&["bunker_plan"])
            .tools(&["fuel_prices"])
            .parallel()
            .estimates(0.02, 1_200),
        WorkerDefinition::new("finalize_agent")
            .consumes(&["bunker_plan"])
            .produces(&["final_response"])
            .estimates(0.002, 300),
        WorkerDefinition::new("vessel_comparison_agent")
            .consumes(&["vessel_candidates"])
            .produces(&["vessel_ranking"])
            .estimates(0.003, 200),
    ];
    let tools = vec![
        ToolDefinition::new("route_calculator").with_fallback(FallbackKind::GreatCircle),
        ToolDefinition::new("weather_api").with_fallback(FallbackKind::InsufficientData),
        ToolDefinition::new("fuel_prices").with_fallback(FallbackKind::CachedOnly),
    ];
    Catalog::new(workers, tools)
}

pub fn default_workflows() -> Vec<WorkflowDefinition> {
    let extract = || WorkflowStep::new("entity_extractor").with_guard(Condition::absent("origin_port"));
    vec![
        WorkflowDefinition::new(
            "voyage_full",
            "voyage_planning",
            vec![
                extract(),
                WorkflowStep::new("route_agent"),
                WorkflowStep::new("weather_agent").optional(),
                WorkflowStep::new("bunker_agent"),
                WorkflowStep::new("finalize_agent"),
            ],
        ),
        WorkflowDefinition::new(
            "bunker_only",
            "bunker_planning",
            vec![
                extract(),
                WorkflowStep::new("route_agent"),
                WorkflowStep::new("bunker_agent"),
                WorkflowStep::new("finalize_agent"),
            ],
        ),
    ]
}

pub fn default_rules() -> Vec<ClassifierRule> {
    vec![
        ClassifierRule {
            query_type: "bunker_planning".into(),
            keywords: vec!["bunker".into(), "fuel".into(), "vlsfo".into()],
            agent_id: None,
        },
        ClassifierRule {
            query_type: "voyage_planning".into(),
            keywords: vec!["voyage".into(), "route".into(), "weather".into(), "sail".into()],
            agent_id: None,
        },
        ClassifierRule {
            query_type: "vessel_comparison".into(),
            keywords: vec!["compare".into(), "vessels".into(), "rank".into()],
            agent_id: Some("vessel_comparison_agent".into()),
        },
    ]
}

pub fn register_workers(registry: &mut WorkerRegistry) {
    registry.register(EntityExtractor);
    registry.register(RouteWorker);
    registry.register(WeatherWorker);
    registry.register(BunkerWorker);
    registry.register(FinalizeWorker);
    registry.register(VesselComparisonWorker);
}

pub fn register_tools(registry: &mut ToolRegistry) {
    registry.register(OfflineRouteCalculator);
    registry.register(OfflineWeather);
    registry.register(OfflineFuelPrices);
}

/// Pulls the IMO number and origin/destination ports out of the query text.
struct EntityExtractor;

impl Worker for EntityExtractor {
    fn id(&self) -> &str {
        "entity_extractor"
    }

    fn execute(&self, input: SharedState, _ctx: WorkerContext) -> BoxFuture<'_, Result<WorkerOutput>> {
        Box::pin(async move {
            let query = input.get_str("query").unwrap_or_default();
            let mut ports: Vec<&'static str> = Vec::new();
            let mut imo: Option<String> = None;

            for raw in query.split(|c: char| !c.is_ascii_alphanumeric()) {
                if raw.len() == 7 && raw.chars().all(|c| c.is_ascii_digit()) {
                    imo.get_or_insert_with(|| raw.to_string());
                    continue;
                }
                let found = PORTS
                    .iter()
                    .find(|p| p.code.eq_ignore_ascii_case(raw) || p.name.eq_ignore_ascii_case(raw));
                if let Some(p) = found {
                    if !ports.contains(&p.code) {
                        ports.push(p.code);
                    }
                }
            }

            if ports.len() < 2 {
                return Err(KeelError::worker_permanent(
                    "entity_extractor",
                    "could not resolve origin and destination ports",
                ));
            }

            let mut out = WorkerOutput::new()
                .with_field("origin_port", json!(ports[0]))
                .with_field("destination_port", json!(ports[1]));
            if let Some(imo) = imo {
                out = out.with_field("vessel_imo", json!(imo));
            }
            Ok(out)
        })
    }
}

fn outcome_into_output(key: &str, outcome: ToolOutcome) -> WorkerOutput {
    match outcome {
        ToolOutcome::Ok(value) => WorkerOutput::new().with_field(key, value),
        ToolOutcome::Degraded(d) => WorkerOutput::new()
            .with_field(key, d.to_marked_json())
            .with_degradation(d),
    }
}

struct RouteWorker;

impl Worker for RouteWorker {
    fn id(&self) -> &str {
        "route_agent"
    }

    fn execute(&self, input: SharedState, ctx: WorkerContext) -> BoxFuture<'_, Result<WorkerOutput>> {
        Box::pin(async move {
            let origin = input.get_str("origin_port").unwrap_or_default();
            let destination = input.get_str("destination_port").unwrap_or_default();
            let args = json!({
                "origin": port_point(origin),
                "destination": port_point(destination),
                "speed_knots": SERVICE_SPEED_KNOTS,
            });
            let outcome = ctx.call_tool("route_calculator", args).await?;
            Ok(outcome_into_output("route_data", outcome))
        })
    }
}

struct WeatherWorker;

impl Worker for WeatherWorker {
    fn id(&self) -> &str {
        "weather_agent"
    }

    fn execute(&self, input: SharedState, ctx: WorkerContext) -> BoxFuture<'_, Result<WorkerOutput>> {
        Box::pin(async move {
            let waypoints = input
                .get("route_data")
                .and_then(|r| r.get("waypoints"))
                .cloned()
                .unwrap_or_else(|| json!([]));
            let outcome = ctx
                .call_tool("weather_api", json!({ "waypoints": waypoints }))
                .await?;
            Ok(outcome_into_output("weather_forecast", outcome))
        })
    }
}

struct BunkerWorker;

impl Worker for BunkerWorker {
    fn id(&self) -> &str {
        "bunker_agent"
    }

    fn execute(&self, input: SharedState, ctx: WorkerContext) -> BoxFuture<'_, Result<WorkerOutput>> {
        Box::pin(async move {
            let route = input
                .get("route_data")
                .ok_or_else(|| KeelError::worker_permanent("bunker_agent", "route_data missing"))?;
            let distance = route
                .get("distance_nm")
                .and_then(|d| d.as_f64())
                .ok_or_else(|| KeelError::worker_permanent("bunker_agent", "route has no distance"))?;

            let days = distance / (SERVICE_SPEED_KNOTS * 24.0);
            let required_mt = (days * DAILY_CONSUMPTION_MT * SAFETY_MARGIN).ceil();

            let outcome = ctx.call_tool("fuel_prices", json!({ "grade": "VLSFO" })).await?;
            let prices = outcome.clone().into_json();

            let cheapest = prices
                .get("prices")
                .and_then(|p| p.as_object())
                .and_then(|p| {
                    p.iter()
                        .filter_map(|(port, price)| price.as_f64().map(|v| (port.clone(), v)))
                        .min_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
                });
            let Some((bunker_port, price)) = cheapest else {
                return Err(KeelError::worker("bunker_agent", "no fuel prices available"));
            };

            let plan = json!({
                "grade": "VLSFO",
                "distance_nm": distance,
                "sea_days": (days * 10.0).round() / 10.0,
                "required_mt": required_mt,
                "bunker_port": bunker_port,
                "price_usd_mt": price,
                "estimated_cost_usd": (required_mt * price).round(),
                "route_estimated": is_marked_degraded(route),
            });
            let mut out = WorkerOutput::new().with_field("bunker_plan", plan);
            if let ToolOutcome::Degraded(d) = outcome {
                out = out.with_degradation(d);
            }
            Ok(out)
        })
    }
}

struct FinalizeWorker;

impl Worker for FinalizeWorker {
    fn id(&self) -> &str {
        "finalize_agent"
    }

    fn execute(&self, input: SharedState, _ctx: WorkerContext) -> BoxFuture<'_, Result<WorkerOutput>> {
        Box::pin(async move {
            let plan = input
                .get("bunker_plan")
                .ok_or_else(|| KeelError::worker_permanent("finalize_agent", "bunker_plan missing"))?;
            let mut text = format!(
                "Bunker {} mt {} at {} (~${} at ${}/mt) for a {} nm passage of {} days.",
                plan["required_mt"],
                plan["grade"].as_str().unwrap_or("VLSFO"),
                plan["bunker_port"].as_str().unwrap_or("?"),
                plan["estimated_cost_usd"],
                plan["price_usd_mt"],
                plan["distance_nm"],
                plan["sea_days"],
            );
            if plan["route_estimated"].as_bool().unwrap_or(false) {
                text.push_str(" Distance is a straight-line estimate; confirm before fixing quantities.");
            }
            Ok(WorkerOutput::new().with_field("final_response", json!(text)))
        })
    }
}

/// Ranks `vessel_candidates` (`[{id, feasible, cost_usd}]`).
struct VesselComparisonWorker;

impl Worker for VesselComparisonWorker {
    fn id(&self) -> &str {
        "vessel_comparison_agent"
    }

    fn execute(&self, input: SharedState, _ctx: WorkerContext) -> BoxFuture<'_, Result<WorkerOutput>> {
        Box::pin(async move {
            let raw = input.get("vessel_candidates").cloned().unwrap_or_else(|| json!([]));
            let candidates: Vec<Candidate> = serde_json::from_value(raw).map_err(|e| {
                KeelError::worker_permanent("vessel_comparison_agent", format!("bad candidates: {}", e))
            })?;
            let ranking = rank_candidates(&candidates);
            Ok(WorkerOutput::new().with_field("vessel_ranking", serde_json::to_value(ranking)?))
        })
    }
}

fn point(args: &Value, field: &str) -> Option<(f64, f64)> {
    let p = args.get(field)?;
    Some((p.get("lat")?.as_f64()?, p.get("lon")?.as_f64()?))
}

/// Sailing distance from the great-circle distance and an average routing factor.
struct OfflineRouteCalculator;

impl Tool for OfflineRouteCalculator {
    fn name(&self) -> &str {
        "route_calculator"
    }

    fn call(&self, args: Value) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let (Some(o), Some(d)) = (point(&args, "origin"), point(&args, "destination")) else {
                return Err(KeelError::ToolExecution {
                    tool: "route_calculator".into(),
                    message: "unknown port".into(),
                });
            };
            let distance = (great_circle_nm(o.0, o.1, d.0, d.1) * ROUTING_FACTOR).round();
            let speed = args
                .get("speed_knots")
                .and_then(|s| s.as_f64())
                .unwrap_or(SERVICE_SPEED_KNOTS);
            Ok(json!({
                "distance_nm": distance,
                "estimated_hours": (distance / speed).round(),
                "method": "routing_table",
                "waypoints": [args["origin"].clone(), args["destination"].clone()],
            }))
        })
    }
}

struct OfflineWeather;

impl Tool for OfflineWeather {
    fn name(&self) -> &str {
        "weather_api"
    }

    fn call(&self, args: Value) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let legs = args["waypoints"].as_array().map_or(0, |w| w.len().saturating_sub(1));
            Ok(json!({
                "legs": legs,
                "max_wave_height_m": 2.5,
                "advisory": "moderate",
            }))
        })
    }
}

struct OfflineFuelPrices;

impl Tool for OfflineFuelPrices {
    fn name(&self) -> &str {
        "fuel_prices"
    }

    fn call(&self, args: Value) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let prices: serde_json::Map<String, Value> = PORTS
                .iter()
                .map(|p| (p.code.to_string(), json!(p.vlsfo_usd_mt)))
                .collect();
            Ok(json!({ "grade": args["grade"].clone(), "prices": prices }))
        })
    }
}
