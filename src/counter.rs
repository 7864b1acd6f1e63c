use crate::retry::RetryPolicy;
use crate::store::{CreateOutcome, Entity, Lookup, TableStore, UpdateOutcome};
use anyhow::{bail, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const COUNTER_PARTITION: &str = "counter";
pub const COUNTER_ROW: &str = "visits";
pub const VISITOR_PARTITION: &str = "visitor";
pub const COUNT_PROPERTY: &str = "count";
pub const LAST_VISIT_PROPERTY: &str = "lastVisit";

pub const DEFAULT_WINDOW_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisitOutcome {
    pub count: u64,
    pub incremented: bool,
}

enum WindowCheck {
    Suppressed,
    Accepted,
    Raced,
}

/// De-duplicating visit counter.
///
/// All state lives in the backing table. The visitor row's atomic create is
/// the gate for first visits, and etag-conditioned updates guard both the
/// visitor refresh and the total counter.
pub struct VisitCounter {
    store: Arc<dyn TableStore>,
    window: Duration,
    retry: RetryPolicy,
}

impl VisitCounter {
    pub fn new(store: Arc<dyn TableStore>, window: Duration) -> Self {
        Self::with_retry(store, window, RetryPolicy::default())
    }

    pub fn with_retry(store: Arc<dyn TableStore>, window: Duration, retry: RetryPolicy) -> Self {
        Self {
            store,
            window,
            retry,
        }
    }

    pub async fn evaluate_visit(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<VisitOutcome> {
        for attempt in 1..=self.retry.max_attempts {
            let existing = match self.store.get(VISITOR_PARTITION, identity).await? {
                Lookup::Found(entity) => entity,
                Lookup::NotFound => {
                    let visitor = visitor_entity(identity, now);
                    match self.store.create(&visitor).await? {
                        CreateOutcome::Created => {
                            info!("New visitor {}", identity);
                            return self.accept().await;
                        }
                        CreateOutcome::AlreadyExists => {
                            debug!(identity, attempt, "Visitor created concurrently, re-reading");
                            match self.store.get(VISITOR_PARTITION, identity).await? {
                                Lookup::Found(entity) => entity,
                                Lookup::NotFound => {
                                    self.retry.pause(attempt).await;
                                    continue;
                                }
                            }
                        }
                    }
                }
            };

            match self.check_window(existing, identity, now).await? {
                WindowCheck::Suppressed => {
                    debug!("Visitor {} seen within window, count unchanged", identity);
                    return Ok(VisitOutcome {
                        count: self.current_total().await?,
                        incremented: false,
                    });
                }
                WindowCheck::Accepted => {
                    info!("Returning visitor {} after window elapsed", identity);
                    return self.accept().await;
                }
                WindowCheck::Raced => {
                    debug!(identity, attempt, "Visitor refresh lost a race, re-evaluating");
                    self.retry.pause(attempt).await;
                }
            }
        }
        bail!(
            "visitor record for {} kept changing after {} attempts",
            identity,
            self.retry.max_attempts
        )
    }

    async fn check_window(
        &self,
        mut visitor: Entity,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<WindowCheck> {
        match last_visit(&visitor) {
            Some(last) if now - last < self.window => return Ok(WindowCheck::Suppressed),
            Some(_) => {}
            None => warn!(
                "Visitor {} has no readable lastVisit, treating as expired",
                identity
            ),
        }

        visitor.set(LAST_VISIT_PROPERTY, format_timestamp(now));
        Ok(match self.store.update(&visitor).await? {
            UpdateOutcome::Updated => WindowCheck::Accepted,
            UpdateOutcome::Conflict | UpdateOutcome::NotFound => WindowCheck::Raced,
        })
    }

    /// Compare-and-swap the total counter forward by one.
    async fn accept(&self) -> Result<VisitOutcome> {
        for attempt in 1..=self.retry.max_attempts {
            match self.store.get(COUNTER_PARTITION, COUNTER_ROW).await? {
                Lookup::NotFound => {
                    let entity = Entity::new(COUNTER_PARTITION, COUNTER_ROW)
                        .with_property(COUNT_PROPERTY, 1u64);
                    match self.store.create(&entity).await? {
                        CreateOutcome::Created => {
                            info!("Created counter entity with count: 1");
                            return Ok(VisitOutcome {
                                count: 1,
                                incremented: true,
                            });
                        }
                        CreateOutcome::AlreadyExists => {
                            debug!(attempt, "Counter created concurrently, retrying");
                            self.retry.pause(attempt).await;
                        }
                    }
                }
                Lookup::Found(mut entity) => {
                    let next = read_count(&entity) + 1;
                    entity.set(COUNT_PROPERTY, next);
                    match self.store.update(&entity).await? {
                        UpdateOutcome::Updated => {
                            info!("Updated counter entity to count: {}", next);
                            return Ok(VisitOutcome {
                                count: next,
                                incremented: true,
                            });
                        }
                        UpdateOutcome::Conflict | UpdateOutcome::NotFound => {
                            debug!(attempt, "Counter changed underneath us, retrying");
                            self.retry.pause(attempt).await;
                        }
                    }
                }
            }
        }
        bail!(
            "counter update contended after {} attempts",
            self.retry.max_attempts
        )
    }

    pub async fn current_total(&self) -> Result<u64> {
        Ok(match self.store.get(COUNTER_PARTITION, COUNTER_ROW).await? {
            Lookup::Found(entity) => read_count(&entity),
            Lookup::NotFound => 0,
        })
    }
}

fn visitor_entity(identity: &str, now: DateTime<Utc>) -> Entity {
    Entity::new(VISITOR_PARTITION, identity)
        .with_property(LAST_VISIT_PROPERTY, format_timestamp(now))
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn last_visit(entity: &Entity) -> Option<DateTime<Utc>> {
    entity
        .get(LAST_VISIT_PROPERTY)
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Tables hand Int64 values back as strings, so accept either form.
pub fn read_count(entity: &Entity) -> u64 {
    match entity.get(COUNT_PROPERTY) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}
