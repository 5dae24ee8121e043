use thiserror::Error;
use ulid::Ulid;

use crate::model::{RepairStage, ReservationStatus};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Ulid },
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("insufficient stock for {equipment_name}: requested {requested}, available {available}")]
    InsufficientStock {
        equipment_name: String,
        requested: u32,
        available: u32,
    },
    #[error("cannot move reservation from {from} to {to}")]
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    #[error("unknown reservation status: {0:?}")]
    UnknownStatus(String),
    #[error("cannot move repair ticket from {from} to {to}")]
    InvalidStage { from: RepairStage, to: RepairStage },
    #[error("asset {asset_id} already has open repair ticket {ticket_id}")]
    RepairAlreadyOpen { asset_id: Ulid, ticket_id: Ulid },
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Stable machine-readable kind for clients.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InsufficientStock { .. } => "insufficient_stock",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::UnknownStatus(_) => "unknown_status",
            EngineError::InvalidStage { .. } => "invalid_stage",
            EngineError::RepairAlreadyOpen { .. } => "repair_already_open",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }

    /// Units missing for an `InsufficientStock` failure.
    pub fn shortfall(&self) -> Option<u32> {
        match self {
            EngineError::InsufficientStock {
                requested,
                available,
                ..
            } => Some(requested.saturating_sub(*available)),
            _ => None,
        }
    }

    pub(crate) fn reservation(id: Ulid) -> Self {
        EngineError::NotFound {
            kind: "reservation",
            id,
        }
    }

    pub(crate) fn equipment(id: Ulid) -> Self {
        EngineError::NotFound {
            kind: "equipment",
            id,
        }
    }

    pub(crate) fn asset(id: Ulid) -> Self {
        EngineError::NotFound { kind: "asset", id }
    }

    pub(crate) fn repair(id: Ulid) -> Self {
        EngineError::NotFound {
            kind: "repair ticket",
            id,
        }
    }
}
