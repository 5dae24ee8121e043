use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "kitlend_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "kitlend_request_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: committed reservation status changes. Labels: from, to.
pub const STATUS_TRANSITIONS_TOTAL: &str = "kitlend_status_transitions_total";

/// Counter: approvals/checkouts refused for lack of units. Labels: to.
pub const INSUFFICIENT_STOCK_TOTAL: &str = "kitlend_insufficient_stock_total";

/// Counter: repair ticket stage changes, forward or reverted. Labels: to.
pub const REPAIR_STAGE_CHANGES_TOTAL: &str = "kitlend_repair_stage_changes_total";

/// Counter: returned units that could not be processed.
pub const RETURN_ITEM_FAILURES_TOTAL: &str = "kitlend_return_item_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "kitlend_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "kitlend_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "kitlend_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "kitlend_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "kitlend_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "kitlend_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a request to a short label for metrics.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::CreateEquipment { .. } => "create_equipment",
        Request::RegisterAsset { .. } => "register_asset",
        Request::SetAssetCondition { .. } => "set_asset_condition",
        Request::CreateReservation { .. } => "create_reservation",
        Request::CheckAvailability { .. } => "check_availability",
        Request::CheckRange { .. } => "check_range",
        Request::SetStatus { .. } => "set_status",
        Request::ProcessReturn { .. } => "process_return",
        Request::CreateRepair { .. } => "create_repair",
        Request::AdvanceRepair { .. } => "advance_repair",
        Request::CompleteRepair { .. } => "complete_repair",
        Request::RevertRepair { .. } => "revert_repair",
        Request::GetReservation { .. } => "get_reservation",
        Request::ListReservations { .. } => "list_reservations",
        Request::GetRepair { .. } => "get_repair",
        Request::ListRepairs { .. } => "list_repairs",
        Request::AssetHistory { .. } => "asset_history",
        Request::ListAssets { .. } => "list_assets",
        Request::ListEquipment => "list_equipment",
    }
}
