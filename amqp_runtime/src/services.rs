//! Registration of named messaging services for an application.
//!
//! A messaging service is a [`Manager`] registered under a name. Registration tolerates
//! an unreachable broker: the failure is logged and the name resolves to
//! [`Lookup::Unavailable`], so the application can start and report it through
//! [`Services::health_report`]. Registering a name again closes the manager it
//! replaces.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::broker::amqp::AmqpBroker;
use crate::broker::Broker;
use crate::config::Config;
use crate::manager::{Manager, Stats};
use crate::Result;

/// Name messaging is usually registered under.
pub const DEFAULT_SERVICE: &str = "rabbitmq";

/// Outcome of [`Services::resolve`].
#[derive(Clone)]
pub enum Lookup {
    Available(Manager),
    /// Never registered, or its broker was unreachable at registration.
    Unavailable,
}

impl Lookup {
    pub fn manager(self) -> Option<Manager> {
        match self {
            Lookup::Available(manager) => Some(manager),
            Lookup::Unavailable => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Lookup::Available(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<Stats>,
}

impl HealthReport {
    fn failed(error: String) -> Self {
        Self {
            status: HealthStatus::Error,
            error: Some(error),
            stats: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == HealthStatus::Ok
    }
}

pub struct Services {
    broker: Arc<dyn Broker>,
    entries: RwLock<HashMap<String, Option<Manager>>>,
}

impl Default for Services {
    fn default() -> Self {
        Self::new()
    }
}

impl Services {
    /// Services connecting to AMQP brokers.
    pub fn new() -> Self {
        Self::with_broker(Arc::new(AmqpBroker))
    }

    pub fn with_broker(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Connect and register a manager under `name`.
    ///
    /// An invalid configuration fails. A broker that can not be reached only leaves
    /// the name unavailable.
    pub async fn register(&self, name: &str, config: Config) -> Result<()> {
        config.validate()?;
        match Manager::with_broker(self.broker.clone(), config).await {
            Ok(manager) => {
                info!("messaging service '{}' registered", name);
                self.store(name, Some(manager)).await;
            }
            Err(err) => {
                warn!(
                    "failed to connect messaging service '{}', cause: {}.",
                    name, err
                );
                self.store(name, None).await;
            }
        }
        Ok(())
    }

    /// Like [`Services::register`], failing when the broker can not be reached.
    pub async fn must_register(&self, name: &str, config: Config) -> Result<Manager> {
        let manager = Manager::with_broker(self.broker.clone(), config)
            .await
            .map_err(|err| {
                error!(
                    "failed to connect messaging service '{}', cause: {}.",
                    name, err
                );
                err
            })?;
        info!("messaging service '{}' registered", name);
        self.store(name, Some(manager.clone())).await;
        Ok(manager)
    }

    pub fn resolve(&self, name: &str) -> Lookup {
        match self.read().get(name) {
            Some(Some(manager)) => Lookup::Available(manager.clone()),
            _ => Lookup::Unavailable,
        }
    }

    /// `ok` with the manager statistics, or `error` with the reason.
    pub async fn health_report(&self, name: &str) -> HealthReport {
        let Some(manager) = self.resolve(name).manager() else {
            return HealthReport::failed(format!("messaging service '{}' not available", name));
        };
        if let Err(err) = manager.health().await {
            return HealthReport::failed(err.to_string());
        }
        HealthReport {
            status: HealthStatus::Ok,
            error: None,
            stats: Some(manager.stats().await),
        }
    }

    /// Close every registered manager and forget them.
    pub async fn close(&self) -> Result<()> {
        let managers: Vec<_> = self.write().drain().collect();
        let mut result = Ok(());
        for (name, manager) in managers {
            let Some(manager) = manager else {
                continue;
            };
            if let Err(err) = manager.close().await {
                warn!("failed to close messaging service '{}', cause: {}.", name, err);
                result = Err(err);
            }
        }
        result
    }

    /// Register under `name`, closing the manager it replaces.
    async fn store(&self, name: &str, manager: Option<Manager>) {
        let replaced = self.write().insert(name.to_owned(), manager);
        let Some(Some(replaced)) = replaced else {
            return;
        };
        warn!(
            "messaging service '{}' registered again, closing the previous manager",
            name
        );
        if let Err(err) = replaced.close().await {
            warn!(
                "failed to close replaced messaging service '{}', cause: {}.",
                name, err
            );
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Option<Manager>>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Option<Manager>>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}
