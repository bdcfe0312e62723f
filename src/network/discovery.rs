//! Playback target discovery
//!
//! [`DiscoverySource`] yields raw up/down announcements for one service type.
//! [`DiscoveryWatcher`] turns them into canonical [`TargetDescriptor`]s,
//! deduplicates by normalized name against the [`DeviceRegistry`], and tells
//! the orchestrator what changed.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tokio::sync::mpsc;

use crate::error::DiscoveryError;
use crate::protocol::TargetDescriptor;
use crate::registry::DeviceRegistry;

/// Model label of multi-device cast groups
const GROUP_MODEL: &str = "Google Cast Group";

/// A raw service announcement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceAnnouncement {
    /// Instance name; `None` for malformed announcements
    pub name: Option<String>,
    pub host: String,
    pub addresses: Vec<Ipv4Addr>,
    pub port: u16,
    pub service_type: String,
    pub txt: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Up(ServiceAnnouncement),
    Down(ServiceAnnouncement),
}

/// A feed of service announcements
#[async_trait]
pub trait DiscoverySource: Send {
    async fn subscribe(
        &mut self,
        service_type: &str,
    ) -> Result<mpsc::Receiver<DiscoveryEvent>, DiscoveryError>;

    async fn stop(&mut self);
}

/// Canonical target name: protocol separators become spaces, whitespace
/// runs collapse, ends are trimmed. Idempotent.
pub fn normalize_name(raw: &str) -> String {
    raw.split(|c: char| c == '.' || c == '_' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build a descriptor, or `None` when the announcement has no usable name
pub fn descriptor_from_announcement(service: &ServiceAnnouncement) -> Option<TargetDescriptor> {
    let name = normalize_name(service.name.as_deref()?);
    if name.is_empty() {
        return None;
    }

    let model = service
        .txt
        .get("md")
        .map(|m| m.trim())
        .filter(|m| !m.is_empty())
        .unwrap_or("Unknown")
        .to_string();

    let mut addresses = service.addresses.clone();
    addresses.sort();
    let address = addresses
        .first()
        .map(ToString::to_string)
        .unwrap_or_else(|| service.host.clone());

    Some(TargetDescriptor {
        name,
        host: service.host.clone(),
        address,
        port: service.port,
        is_group: model == GROUP_MODEL,
        model,
    })
}

/// What the watcher tells the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherNotification {
    TargetFound(TargetDescriptor),
    TargetLost(String),
}

/// Normalizes announcements and keeps the registry's descriptor map
pub struct DiscoveryWatcher {
    service_type: String,
}

impl DiscoveryWatcher {
    pub fn new(service_type: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
        }
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub async fn subscribe(
        &self,
        source: &mut dyn DiscoverySource,
    ) -> Result<mpsc::Receiver<DiscoveryEvent>, DiscoveryError> {
        tracing::info!("Starting discovery for {}", self.service_type);
        source.subscribe(&self.service_type).await
    }

    /// Apply one event to the registry.
    ///
    /// A re-announcement of a known name is ignored without refreshing its
    /// address. Malformed announcements are dropped.
    pub fn handle_event<S>(
        &self,
        registry: &DeviceRegistry<S>,
        event: DiscoveryEvent,
    ) -> Option<WatcherNotification> {
        match event {
            DiscoveryEvent::Up(service) => {
                let descriptor = descriptor_from_announcement(&service)?;
                if !registry.insert_device(descriptor.clone()) {
                    tracing::trace!("Ignoring re-announcement of {}", descriptor.name);
                    return None;
                }
                tracing::info!(
                    "Found cast device {} at {}:{} ({})",
                    descriptor.name,
                    descriptor.address,
                    descriptor.port,
                    descriptor.model
                );
                Some(WatcherNotification::TargetFound(descriptor))
            }
            DiscoveryEvent::Down(service) => {
                let name = normalize_name(service.name.as_deref()?);
                if name.is_empty() {
                    return None;
                }
                registry.remove_device(&name);
                tracing::info!("Lost cast device {}", name);
                Some(WatcherNotification::TargetLost(name))
            }
        }
    }
}

/// Instance part of an mDNS full name
pub fn instance_name(fullname: &str, service_type: &str) -> String {
    let suffix = format!(".{}", service_type.trim_start_matches('.'));
    fullname
        .trim()
        .strip_suffix(suffix.as_str())
        .unwrap_or(fullname)
        .trim_matches('.')
        .to_string()
}

/// Discovery over multicast DNS
pub struct MdnsDiscovery {
    daemon: Option<mdns_sd::ServiceDaemon>,
    service_type: Option<String>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl MdnsDiscovery {
    pub fn new() -> Self {
        Self {
            daemon: None,
            service_type: None,
            task: None,
        }
    }
}

impl Default for MdnsDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DiscoverySource for MdnsDiscovery {
    async fn subscribe(
        &mut self,
        service_type: &str,
    ) -> Result<mpsc::Receiver<DiscoveryEvent>, DiscoveryError> {
        let daemon =
            mdns_sd::ServiceDaemon::new().map_err(|e| DiscoveryError::Daemon(e.to_string()))?;
        let browse = daemon
            .browse(service_type)
            .map_err(|e| DiscoveryError::Browse {
                service_type: service_type.to_string(),
                reason: e.to_string(),
            })?;

        let (tx, rx) = mpsc::channel(64);
        let ty = service_type.to_string();
        let task = tokio::spawn(async move {
            while let Ok(event) = browse.recv_async().await {
                let mapped = match event {
                    mdns_sd::ServiceEvent::ServiceResolved(info) => {
                        DiscoveryEvent::Up(announcement_from_info(&info, &ty))
                    }
                    mdns_sd::ServiceEvent::ServiceRemoved(service_type, fullname) => {
                        DiscoveryEvent::Down(ServiceAnnouncement {
                            name: Some(instance_name(&fullname, &service_type)),
                            service_type,
                            ..Default::default()
                        })
                    }
                    _ => continue,
                };
                if tx.send(mapped).await.is_err() {
                    break;
                }
            }
            tracing::debug!("mDNS browse for {} ended", ty);
        });

        self.daemon = Some(daemon);
        self.service_type = Some(service_type.to_string());
        self.task = Some(task);
        Ok(rx)
    }

    async fn stop(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            if let Some(ty) = self.service_type.take() {
                if let Err(e) = daemon.stop_browse(&ty) {
                    tracing::debug!("Failed to stop mDNS browse cleanly: {}", e);
                }
            }
            if let Err(e) = daemon.shutdown() {
                tracing::debug!("Failed to shut down mDNS daemon: {}", e);
            }
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn announcement_from_info(info: &mdns_sd::ServiceInfo, service_type: &str) -> ServiceAnnouncement {
    let name = instance_name(info.get_fullname(), service_type);
    let txt = info
        .get_properties()
        .iter()
        .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
        .collect();

    ServiceAnnouncement {
        name: Some(name).filter(|n| !n.is_empty()),
        host: info.get_hostname().trim_end_matches('.').to_string(),
        addresses: info.get_addresses_v4().into_iter().copied().collect(),
        port: info.get_port(),
        service_type: service_type.to_string(),
        txt,
    }
}
