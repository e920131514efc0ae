use keel_core::catalog::{
    BackoffStrategy, Catalog, FallbackKind, RetryPolicy, ToolDefinition, WorkerDefinition,
};
use keel_core::state::SharedState;
use keel_core::workflow::{Condition, WorkflowDefinition, WorkflowStep};

/// Short linear backoff so retry tests stay fast.
pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        backoff_ms: 10,
        strategy: BackoffStrategy::Linear,
        max_backoff_ms: 100,
    }
}

/// Voyage-planning catalog: extraction, route, weather, bunker, finalize,
/// plus a vessel comparison worker.
pub fn maritime_catalog() -> Catalog {
    let workers = vec![
        WorkerDefinition::new("entity_extractor")
            .consumes(&["query"])
            .produces(&["vessel_imo", "origin_port", "destination_port"])
            .estimates(0.001, 200)
            .retry(fast_retry(1)),
        WorkerDefinition::new("route_agent")
            .consumes(&["origin_port", "destination_port"])
            .produces(&["route_data"])
            .tools(&["route_calculator"])
            .estimates(0.01, 1_500)
            .retry(fast_retry(2)),
        WorkerDefinition::new("weather_agent")
            .consumes(&["route_data"])
            .produces(&["weather_forecast"])
            .tools(&["weather_api"])
            .parallel()
            .estimates(0.005, 800)
            .retry(fast_retry(2)),
        WorkerDefinition::new("bunker_agent")
            .consumes(&["route_data"])
            .produces(&["bunker_plan"])
            .tools(&["fuel_prices"])
            .parallel()
            .estimates(0.02, 1_200)
            .retry(fast_retry(2)),
        WorkerDefinition::new("finalize_agent")
            .consumes(&["bunker_plan"])
            .produces(&["final_response"])
            .estimates(0.002, 300)
            .retry(fast_retry(0)),
        WorkerDefinition::new("vessel_comparison_agent")
            .consumes(&["vessel_candidates"])
            .produces(&["vessel_ranking"])
            .estimates(0.003, 400)
            .retry(fast_retry(0)),
    ];
    let tools = vec![
        ToolDefinition::new("route_calculator").with_fallback(FallbackKind::GreatCircle),
        ToolDefinition::new("weather_api").with_fallback(FallbackKind::InsufficientData),
        ToolDefinition::new("fuel_prices").with_fallback(FallbackKind::CachedOnly),
    ];
    Catalog::new(workers, tools)
}

/// Full voyage workflow. Extraction is skipped once ports are known.
pub fn voyage_workflow() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "voyage_full",
        "voyage_planning",
        vec![
            WorkflowStep::new("entity_extractor").with_guard(Condition::absent("origin_port")),
            WorkflowStep::new("route_agent"),
            WorkflowStep::new("weather_agent").optional(),
            WorkflowStep::new("bunker_agent"),
            WorkflowStep::new("finalize_agent"),
        ],
    )
}

/// route -> bunker -> finalize.
pub fn bunker_workflow() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "bunker_linear",
        "bunker_planning",
        vec![
            WorkflowStep::new("route_agent"),
            WorkflowStep::new("bunker_agent"),
            WorkflowStep::new("finalize_agent"),
        ],
    )
}

/// State with the vessel and ports already resolved.
pub fn voyage_state() -> SharedState {
    let mut st = SharedState::new();
    st.set_str("query", "Plan bunkering for Rotterdam to Singapore");
    st.set_str("vessel_imo", "9321483");
    st.set_str("origin_port", "NLRTM");
    st.set_str("destination_port", "SGSIN");
    st
}
