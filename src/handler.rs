use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::clock::Clock;
use crate::engine::{Commit, Engine, EngineError};
use crate::observability::{command_label, COMMANDS_TOTAL, COMMAND_DURATION_SECONDS, THROTTLED_TOTAL};
use crate::sql::{self, Command, SqlError};
use crate::throttle::{StatusThrottle, ThrottleDecision};
use crate::upcoming::UpcomingCache;

/// Result of one statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Execution { tag: &'static str, rows: usize },
    Rows(Vec<Value>),
}

impl Response {
    pub fn to_json(&self) -> Value {
        match self {
            Response::Execution { tag, rows } => json!({ "tag": tag, "rows": rows }),
            Response::Rows(rows) => json!({ "rows": rows }),
        }
    }
}

#[derive(Debug)]
pub enum HandlerError {
    Sql(SqlError),
    Engine(EngineError),
    RateLimited {
        reservation_id: Ulid,
        retry_after: Duration,
    },
    Encode(serde_json::Error),
}

impl HandlerError {
    /// SQLSTATE-style code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            HandlerError::Sql(_) => "42601",
            HandlerError::RateLimited { .. } => "53400",
            HandlerError::Encode(_) => "XX000",
            HandlerError::Engine(e) => match e {
                EngineError::NotFound(_) => "02000",
                EngineError::AlreadyExists(_) | EngineError::DuplicateRoomNumber(_) => "23505",
                EngineError::Transition(_) => "P0001",
                EngineError::AvailabilityConflict { .. } => "23P01",
                EngineError::InvalidDateRange { .. }
                | EngineError::ImmutableField(_)
                | EngineError::InvalidField(_)
                | EngineError::LimitExceeded(_) => "23514",
                EngineError::WalError(_) => "58030",
            },
        }
    }

    pub fn to_json(&self) -> Value {
        let mut body = json!({ "error": self.to_string(), "code": self.code() });
        if let HandlerError::RateLimited { retry_after, .. } = self {
            body["retry_after_ms"] = json!(retry_after.as_millis() as u64);
        }
        body
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::Sql(e) => write!(f, "{e}"),
            HandlerError::Engine(e) => write!(f, "{e}"),
            HandlerError::RateLimited {
                reservation_id,
                retry_after,
            } => write!(
                f,
                "status of reservation {reservation_id} changed too recently, retry in {}s",
                retry_after.as_secs_f64().ceil() as u64
            ),
            HandlerError::Encode(e) => write!(f, "encode error: {e}"),
        }
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandlerError::Sql(e) => Some(e),
            HandlerError::Engine(e) => Some(e),
            HandlerError::Encode(e) => Some(e),
            HandlerError::RateLimited { .. } => None,
        }
    }
}

impl From<SqlError> for HandlerError {
    fn from(e: SqlError) -> Self {
        HandlerError::Sql(e)
    }
}

impl From<EngineError> for HandlerError {
    fn from(e: EngineError) -> Self {
        HandlerError::Engine(e)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::Encode(e)
    }
}

fn to_rows<T: Serialize>(items: impl IntoIterator<Item = T>) -> Result<Response, HandlerError> {
    let rows = items
        .into_iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Response::Rows(rows))
}

const INSERTED: Response = Response::Execution { tag: "INSERT", rows: 1 };
const UPDATED: Response = Response::Execution { tag: "UPDATE", rows: 1 };

/// Executes statements against the engine: throttle first, then the engine,
/// then a cache refresh for anything that changed.
pub struct Handler {
    engine: Arc<Engine>,
    throttle: Arc<StatusThrottle>,
    cache: Arc<UpcomingCache>,
    clock: Arc<dyn Clock>,
}

impl Handler {
    pub fn new(
        engine: Arc<Engine>,
        throttle: Arc<StatusThrottle>,
        cache: Arc<UpcomingCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            engine,
            throttle,
            cache,
            clock,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn cache(&self) -> &Arc<UpcomingCache> {
        &self.cache
    }

    pub async fn execute(&self, statement: &str) -> Result<Response, HandlerError> {
        let cmd = sql::parse_sql(statement).inspect_err(|_| {
            metrics::counter!(COMMANDS_TOTAL, "command" => "unparsed", "status" => "error")
                .increment(1);
        })?;
        self.execute_command(cmd).await
    }

    pub async fn execute_command(&self, cmd: Command) -> Result<Response, HandlerError> {
        let label = command_label(&cmd);
        let start = Instant::now();
        let result = self.dispatch(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(COMMANDS_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(COMMAND_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            debug!(command = label, code = e.code(), error = %e, "command rejected");
        }
        result
    }

    async fn dispatch(&self, cmd: Command) -> Result<Response, HandlerError> {
        match cmd {
            Command::InsertGuest {
                id,
                first_name,
                last_name,
            } => {
                self.engine
                    .create_guest(id, first_name, last_name, self.clock.now())
                    .await?;
                Ok(INSERTED)
            }
            Command::UpdateGuest { id, patch } => {
                let commit = self.engine.update_guest(id, patch, self.clock.now()).await?;
                self.after_commit(id, commit);
                Ok(UPDATED)
            }
            Command::InsertRoom { id, number } => {
                self.engine.create_room(id, number, self.clock.now()).await?;
                Ok(INSERTED)
            }
            Command::UpdateRoom { id, number } => {
                let commit = self.engine.update_room(id, number, self.clock.now()).await?;
                self.after_commit(id, commit);
                Ok(UPDATED)
            }
            Command::InsertReservation(new) => {
                let id = new.id;
                let commit = self.engine.create_reservation(new, self.clock.now()).await?;
                self.after_commit(id, commit);
                Ok(INSERTED)
            }
            Command::UpdateReservation { id, patch } => {
                // Unknown ids answer NotFound and leave no throttle state behind.
                if self.engine.room_for_reservation(&id).is_none() {
                    return Err(EngineError::NotFound(id).into());
                }
                let now = self.clock.now();
                let decision =
                    self.throttle
                        .check(id, patch.includes_status(), now.timestamp_millis());
                if let ThrottleDecision::RateLimited { retry_after } = decision {
                    metrics::counter!(THROTTLED_TOTAL).increment(1);
                    warn!(
                        reservation_id = %id,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "status change throttled"
                    );
                    return Err(HandlerError::RateLimited {
                        reservation_id: id,
                        retry_after,
                    });
                }
                let commit = self.engine.update_reservation(id, patch, now).await?;
                self.after_commit(id, commit);
                Ok(UPDATED)
            }
            Command::SelectGuests { id: Some(id) } => {
                to_rows(self.engine.get_guest(&id).await)
            }
            Command::SelectGuests { id: None } => to_rows(self.engine.list_guests().await),
            Command::SelectRooms { id: Some(id) } => to_rows(self.engine.get_room(&id).await),
            Command::SelectRooms { id: None } => to_rows(self.engine.list_rooms().await),
            Command::SelectReservations { id, room_id } => {
                let mut rows = match id {
                    Some(id) => self.engine.get_reservation(&id).await.into_iter().collect(),
                    None => self.engine.list_reservations(room_id).await?,
                };
                if let (Some(_), Some(room_id)) = (id, room_id) {
                    rows.retain(|r| r.room_id == room_id);
                }
                to_rows(rows)
            }
            Command::SelectUpcoming => {
                let view = self.cache.current();
                to_rows(view.entries.iter())
            }
            Command::SelectAvailability {
                room_id,
                arrival,
                departure,
                exclude,
            } => {
                let conflict = match self
                    .engine
                    .check_availability(room_id, arrival, departure, exclude)
                    .await
                {
                    Ok(()) => None,
                    Err(EngineError::AvailabilityConflict { reservation_id, .. }) => {
                        Some(reservation_id)
                    }
                    Err(e) => return Err(e.into()),
                };
                Ok(Response::Rows(vec![json!({
                    "room_id": room_id,
                    "arrival": arrival,
                    "departure": departure,
                    "available": conflict.is_none(),
                    "conflicting_reservation_id": conflict,
                })]))
            }
        }
    }

    fn after_commit(&self, id: Ulid, commit: Commit) {
        if commit.changed {
            self.cache.schedule_refresh(id);
        }
    }
}
