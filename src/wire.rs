use std::sync::Arc;

use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::debug;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::limits::MAX_REQUEST_LINE_BYTES;
use crate::model::*;

/// One request per line: `{"op": "<name>", ...fields}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    CreateEquipment {
        id: Option<Ulid>,
        name: String,
    },
    RegisterAsset {
        id: Option<Ulid>,
        equipment_id: Ulid,
        note: Option<String>,
    },
    SetAssetCondition {
        asset_id: Ulid,
        condition: AssetCondition,
        note: Option<String>,
    },
    CreateReservation {
        requester: Requester,
        purpose: String,
        start: NaiveDate,
        end: NaiveDate,
        items: Vec<NewLineItem>,
    },
    CheckAvailability {
        reservation_id: Ulid,
    },
    CheckRange {
        equipment_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    },
    SetStatus {
        reservation_id: Ulid,
        status: String,
        repair_note: Option<String>,
    },
    ProcessReturn {
        reservation_id: Ulid,
        items: Vec<ReturnItem>,
    },
    CreateRepair {
        reservation_id: Option<Ulid>,
        asset_id: Option<Ulid>,
        damage: DamageKind,
        description: String,
        requester: Option<Requester>,
    },
    AdvanceRepair {
        repair_id: Ulid,
        payload: StagePayload,
    },
    CompleteRepair {
        repair_id: Ulid,
        result: RepairResult,
        memo: Option<String>,
    },
    RevertRepair {
        repair_id: Ulid,
        stage: RepairStage,
    },
    GetReservation {
        reservation_id: Ulid,
    },
    ListReservations {
        status: Option<ReservationStatus>,
    },
    GetRepair {
        repair_id: Ulid,
    },
    ListRepairs {
        asset_id: Option<Ulid>,
    },
    AssetHistory {
        asset_id: Ulid,
    },
    ListAssets {
        equipment_id: Ulid,
    },
    ListEquipment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn failure(err: &WireError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                kind: err.kind().to_string(),
                message: err.to_string(),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("malformed request: {0}")]
    BadRequest(serde_json::Error),
    #[error("request line too long")]
    LineTooLong,
    #[error("could not encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

impl WireError {
    pub fn kind(&self) -> &'static str {
        match self {
            WireError::Engine(e) => e.kind(),
            WireError::BadRequest(_) => "bad_request",
            WireError::LineTooLong => "limit_exceeded",
            WireError::Encode(_) => "internal",
        }
    }
}

fn data<T: Serialize>(value: T) -> Result<Value, WireError> {
    Ok(serde_json::to_value(value)?)
}

/// Run one request against the engine.
pub async fn execute(engine: &Engine, req: Request) -> Result<Value, WireError> {
    match req {
        Request::CreateEquipment { id, name } => {
            let id = id.unwrap_or_else(Ulid::new);
            engine.create_equipment(id, name).await?;
            data(serde_json::json!({ "id": id }))
        }
        Request::RegisterAsset {
            id,
            equipment_id,
            note,
        } => {
            let id = id.unwrap_or_else(Ulid::new);
            data(engine.register_asset(id, equipment_id, note).await?)
        }
        Request::SetAssetCondition {
            asset_id,
            condition,
            note,
        } => data(engine.set_asset_condition(asset_id, condition, note).await?),
        Request::CreateReservation {
            requester,
            purpose,
            start,
            end,
            items,
        } => {
            let new = NewReservation {
                requester,
                purpose,
                range: DateRange { start, end },
                items,
            };
            data(engine.create_reservation(new).await?)
        }
        Request::CheckAvailability { reservation_id } => {
            data(engine.check_availability(reservation_id).await?)
        }
        Request::CheckRange {
            equipment_id,
            start,
            end,
        } => data(
            engine
                .check_range(equipment_id, DateRange { start, end })
                .await?,
        ),
        Request::SetStatus {
            reservation_id,
            status,
            repair_note,
        } => data(
            engine
                .set_status_str(reservation_id, &status, repair_note)
                .await?,
        ),
        Request::ProcessReturn {
            reservation_id,
            items,
        } => data(engine.process_return(reservation_id, items).await?),
        Request::CreateRepair {
            reservation_id,
            asset_id,
            damage,
            description,
            requester,
        } => {
            let new = NewRepair {
                reservation_id,
                asset_id,
                damage,
                description,
                requester,
            };
            data(engine.create_repair(new).await?)
        }
        Request::AdvanceRepair { repair_id, payload } => {
            data(engine.advance_repair(repair_id, payload).await?)
        }
        Request::CompleteRepair {
            repair_id,
            result,
            memo,
        } => data(engine.complete_repair(repair_id, result, memo).await?),
        Request::RevertRepair { repair_id, stage } => {
            data(engine.revert_stage(repair_id, stage).await?)
        }
        Request::GetReservation { reservation_id } => {
            data(engine.get_reservation(reservation_id)?)
        }
        Request::ListReservations { status } => data(engine.list_reservations(status)),
        Request::GetRepair { repair_id } => data(engine.get_repair(repair_id)?),
        Request::ListRepairs { asset_id } => data(engine.list_repairs(asset_id)),
        Request::AssetHistory { asset_id } => data(engine.asset_history(asset_id)?),
        Request::ListAssets { equipment_id } => data(engine.list_assets(equipment_id).await?),
        Request::ListEquipment => data(engine.list_equipment().await),
    }
}

/// Parse, execute and time one request line.
pub async fn handle_line(engine: &Engine, line: &str) -> Response {
    let req: Request = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => {
            metrics::counter!(crate::observability::REQUESTS_TOTAL, "op" => "unknown", "status" => "error")
                .increment(1);
            return Response::failure(&WireError::BadRequest(e));
        }
    };

    let op = crate::observability::op_label(&req);
    let start = std::time::Instant::now();
    let result = execute(engine, req).await;
    metrics::histogram!(crate::observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(start.elapsed().as_secs_f64());

    match result {
        Ok(value) => {
            metrics::counter!(crate::observability::REQUESTS_TOTAL, "op" => op, "status" => "ok")
                .increment(1);
            Response::success(value)
        }
        Err(e) => {
            metrics::counter!(crate::observability::REQUESTS_TOTAL, "op" => op, "status" => "error")
                .increment(1);
            debug!("{op} failed: {e}");
            Response::failure(&e)
        }
    }
}

/// Serve one client until it disconnects. Requests on a connection are
/// handled in order; each gets exactly one response line.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
) -> Result<(), LinesCodecError> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_REQUEST_LINE_BYTES));

    while let Some(frame) = framed.next().await {
        let response = match frame {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => handle_line(&engine, &line).await,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                Response::failure(&WireError::LineTooLong)
            }
            Err(e) => return Err(e),
        };
        let encoded = match serde_json::to_string(&response) {
            Ok(s) => s,
            Err(e) => {
                let fallback = Response::failure(&WireError::Encode(e));
                serde_json::to_string(&fallback).unwrap_or_default()
            }
        };
        framed.send(encoded).await?;
    }
    Ok(())
}
