// Controller registry: owns every link and maps logical motor indices onto them
//
// Logical index i (1-based) lives on link (i-1)/2, slot (i-1)%2. Links are
// append-only, so the mapping is recomputed from the current link count on
// every call and never cached.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::loader::{ControllerConfig, LoadIssue, LoadReport};
use crate::messages::{MotorParams, ParamsUpdate, Telemetry};
use crate::motor::link::{Link, LinkOptions, SLOTS_PER_LINK};
use crate::motor::state::{MotorCell, MotorView};
use crate::motor::transport::{Connector, SerialConnector, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Port {port} is not available")]
    PortUnavailable { port: String },

    #[error("Port {port} is already registered")]
    DuplicatePort { port: String },

    #[error("Motor {index} not found ({count} motors registered)")]
    MotorNotFound { index: usize, count: usize },

    #[error("Could not list serial ports: {0}")]
    Enumerate(#[from] TransportError),

    #[error("Could not start worker for {port}: {source}")]
    Spawn {
        port: String,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Returned by `add_link`: where the new link sits in the index space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkHandle {
    pub link: usize,
    pub port: String,
    /// Logical indices of slot 0 and slot 1
    pub motors: [usize; SLOTS_PER_LINK],
}

/// Map a 1-based logical index onto (link, slot) given the current link count
pub fn locate(index: usize, link_count: usize) -> Option<(usize, usize)> {
    if index == 0 || index > link_count * SLOTS_PER_LINK {
        return None;
    }
    let zero_based = index - 1;
    Some((zero_based / SLOTS_PER_LINK, zero_based % SLOTS_PER_LINK))
}

/// Logical index of `slot` on link `link`
pub fn logical_index(link: usize, slot: usize) -> usize {
    link * SLOTS_PER_LINK + slot + 1
}

pub struct Registry {
    links: Vec<Link>,
    connector: Arc<dyn Connector>,
    options: LinkOptions,
}

impl Registry {
    /// Registry over the host's serial ports with default timing
    pub fn new() -> Self {
        Self::with_connector(Arc::new(SerialConnector), LinkOptions::default())
    }

    pub fn with_connector(connector: Arc<dyn Connector>, options: LinkOptions) -> Self {
        Self {
            links: Vec::new(),
            connector,
            options,
        }
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn motor_count(&self) -> usize {
        self.links.len() * SLOTS_PER_LINK
    }

    /// Register a board and start its worker; nothing is mutated on failure
    pub fn add_link(&mut self, port: &str, baud_rate: u32) -> Result<LinkHandle> {
        if self.links.iter().any(|link| link.port_name() == port) {
            return Err(RegistryError::DuplicatePort {
                port: port.to_string(),
            });
        }

        let available = self.connector.available_ports()?;
        if !available.iter().any(|name| name == port) {
            warn!("Port {} not found among {:?}", port, available);
            return Err(RegistryError::PortUnavailable {
                port: port.to_string(),
            });
        }

        let link = Link::spawn(port, baud_rate, Arc::clone(&self.connector), self.options)
            .map_err(|source| RegistryError::Spawn {
                port: port.to_string(),
                source,
            })?;
        let index = self.links.len();
        self.links.push(link);

        let handle = LinkHandle {
            link: index,
            port: port.to_string(),
            motors: [logical_index(index, 0), logical_index(index, 1)],
        };
        info!(
            "Registered {} at {} baud as motors {:?}",
            port, baud_rate, handle.motors
        );
        Ok(handle)
    }

    fn cell(&self, index: usize) -> Option<&MotorCell> {
        let (link, slot) = locate(index, self.links.len())?;
        self.links[link].motor(slot)
    }

    fn cell_or_err(&self, index: usize) -> Result<&MotorCell> {
        self.cell(index).ok_or(RegistryError::MotorNotFound {
            index,
            count: self.motor_count(),
        })
    }

    /// Copy of a motor's current state, `None` when out of range
    pub fn motor_by_index(&self, index: usize) -> Option<MotorView> {
        self.cell(index).map(MotorCell::view)
    }

    /// Apply the present fields of `update` and mark the motor for pushing
    pub fn update_motor(&self, index: usize, update: ParamsUpdate) -> Result<()> {
        self.cell_or_err(index)?.lock().update(&update);
        info!("Updated motor {}: {:?}", index, update);
        Ok(())
    }

    /// Give every motor the same setpoint
    pub fn update_all_setpoints(&self, setpoint: f64) {
        let update = ParamsUpdate::setpoint(setpoint);
        for cell in self.links.iter().flat_map(|link| link.motors().iter()) {
            cell.lock().update(&update);
        }
        info!("Set all {} motors to setpoint {}", self.motor_count(), setpoint);
    }

    /// Port owning a logical index, for display
    pub fn port_of(&self, index: usize) -> Option<&str> {
        let (link, _) = locate(index, self.links.len())?;
        Some(self.links[link].port_name())
    }

    /// Registered ports in registration order
    pub fn ports(&self) -> Vec<&str> {
        self.links.iter().map(Link::port_name).collect()
    }

    fn views(&self) -> impl Iterator<Item = (usize, MotorView)> + '_ {
        self.links.iter().enumerate().flat_map(|(link_idx, link)| {
            link.motors()
                .iter()
                .enumerate()
                .map(move |(slot, cell)| (logical_index(link_idx, slot), cell.view()))
        })
    }

    /// Every motor's state keyed by logical index
    pub fn motors_all(&self) -> BTreeMap<usize, MotorView> {
        self.views().collect()
    }

    /// Last cached telemetry for every motor; never waits on a board
    pub fn snapshot_all(&self) -> BTreeMap<usize, Telemetry> {
        self.views().map(|(index, view)| (index, view.telemetry)).collect()
    }

    pub fn params_all(&self) -> BTreeMap<usize, MotorParams> {
        self.views().map(|(index, view)| (index, view.params)).collect()
    }

    /// Register every link in `config`, then apply its per-motor parameters.
    ///
    /// Problems are collected in the report; one bad entry does not stop the rest.
    pub fn load_from_config(&mut self, config: &ControllerConfig) -> LoadReport {
        let mut report = LoadReport::default();

        for entry in &config.links {
            let baud_rate = entry.baud_rate.unwrap_or(config.default_baud);
            let handle = match self.add_link(&entry.port, baud_rate) {
                Ok(handle) => handle,
                Err(e) => {
                    warn!("Skipping link {}: {}", entry.port, e);
                    report.issues.push(LoadIssue::Link {
                        port: entry.port.clone(),
                        reason: e.to_string(),
                    });
                    for key in entry.motors.keys() {
                        report.issues.push(LoadIssue::Motor {
                            port: entry.port.clone(),
                            key: key.clone(),
                            reason: "link was not registered".to_string(),
                        });
                    }
                    continue;
                }
            };
            report.links.push(handle.clone());

            for (key, update) in &entry.motors {
                let resolved = resolve_slot(key).map(|slot| logical_index(handle.link, slot));
                let Some(index) = resolved else {
                    warn!("Motor {:?} under {} does not name slot 1 or 2", key, entry.port);
                    report.issues.push(LoadIssue::Motor {
                        port: entry.port.clone(),
                        key: key.clone(),
                        reason: "expected slot \"1\" or \"2\"".to_string(),
                    });
                    continue;
                };
                if let Err(e) = self.update_motor(index, *update) {
                    report.issues.push(LoadIssue::Motor {
                        port: entry.port.clone(),
                        key: key.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        report
    }

    /// Stop every worker and wait for all of them
    pub fn stop_all(&mut self) {
        // Flag everything first so the workers wind down in parallel
        for link in &self.links {
            link.request_stop();
        }
        let joined = self.links.iter_mut().map(Link::join).filter(|&joined| joined).count();
        if joined > 0 {
            info!("Stopped {} links", joined);
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Config keys "1"/"2" name the slot within their link
fn resolve_slot(key: &str) -> Option<usize> {
    match key.trim().parse::<usize>() {
        Ok(n) if (1..=SLOTS_PER_LINK).contains(&n) => Some(n - 1),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader;
    use crate::motor::codec;
    use crate::motor::transport::mock::{Board, MockConnector};
    use crate::runtime::average_speed;
    use std::thread;
    use std::time::{Duration, Instant};

    fn fast_options() -> LinkOptions {
        LinkOptions {
            reconnect_backoff: Duration::from_millis(5),
            poll_interval: Duration::from_millis(1),
            ..LinkOptions::default()
        }
    }

    fn registry_with(boards: &[(&str, &Board)]) -> Registry {
        let connector = boards
            .iter()
            .fold(MockConnector::new(), |c, (port, board)| c.with_board(port, board));
        Registry::with_connector(Arc::new(connector), fast_options())
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    #[test]
    fn test_locate_mapping() {
        assert_eq!(locate(0, 3), None);
        assert_eq!(locate(1, 3), Some((0, 0)));
        assert_eq!(locate(2, 3), Some((0, 1)));
        assert_eq!(locate(3, 3), Some((1, 0)));
        assert_eq!(locate(6, 3), Some((2, 1)));
        assert_eq!(locate(7, 3), None);
        assert_eq!(locate(1, 0), None);

        for links in 1..5 {
            for i in 1..=2 * links {
                assert_eq!(locate(i, links), Some(((i - 1) / 2, (i - 1) % 2)));
                let (link, slot) = locate(i, links).unwrap();
                assert_eq!(logical_index(link, slot), i);
            }
        }
    }

    #[test]
    fn test_empty_registry() {
        let registry = registry_with(&[]);
        assert!(registry.snapshot_all().is_empty());
        assert!(registry.params_all().is_empty());
        assert!(registry.motor_by_index(1).is_none());
        assert_eq!(average_speed(&registry.snapshot_all()), 0.0);
    }

    #[test]
    fn test_add_link_rejects_missing_port() {
        let board = Board::new();
        let mut registry = registry_with(&[("P1", &board)]);

        let err = registry.add_link("P9", 1_000_000).unwrap_err();
        assert!(matches!(err, RegistryError::PortUnavailable { ref port } if port == "P9"));
        assert_eq!(registry.link_count(), 0);
    }

    #[test]
    fn test_add_link_rejects_duplicate() {
        let board = Board::new();
        let mut registry = registry_with(&[("P1", &board)]);

        registry.add_link("P1", 1_000_000).unwrap();
        let err = registry.add_link("P1", 115_200).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicatePort { .. }));
        assert_eq!(registry.link_count(), 1);
    }

    #[test]
    fn test_indices_follow_registration_order() {
        let a = Board::new();
        let b = Board::new();
        let mut registry = registry_with(&[("A", &a), ("B", &b)]);

        let first = registry.add_link("B", 1_000_000).unwrap();
        let second = registry.add_link("A", 1_000_000).unwrap();
        assert_eq!(first.motors, [1, 2]);
        assert_eq!(second.motors, [3, 4]);

        assert_eq!(registry.port_of(2), Some("B"));
        assert_eq!(registry.port_of(3), Some("A"));
        assert_eq!(registry.port_of(5), None);
        assert_eq!(registry.ports(), vec!["B", "A"]);
        assert!(registry.motor_by_index(4).is_some());
        assert!(registry.motor_by_index(5).is_none());
    }

    #[test]
    fn test_update_out_of_range() {
        let board = Board::new();
        let mut registry = registry_with(&[("P1", &board)]);
        registry.add_link("P1", 1_000_000).unwrap();

        let err = registry.update_motor(3, ParamsUpdate::setpoint(1.0)).unwrap_err();
        assert!(matches!(err, RegistryError::MotorNotFound { index: 3, count: 2 }));
        assert!(registry.update_motor(0, ParamsUpdate::setpoint(1.0)).is_err());
    }

    #[test]
    fn test_kp_only_update_leaves_rest() {
        // Board refuses writes so the worker cannot clear `dirty` under us
        let board = Board::new();
        board.set_fail_open(true);
        let mut registry = registry_with(&[("P1", &board)]);
        registry.add_link("P1", 1_000_000).unwrap();

        registry
            .update_motor(2, ParamsUpdate::setpoint(40.0).with_ki(0.2).with_kd(0.1))
            .unwrap();
        registry.update_motor(2, ParamsUpdate::default().with_kp(2.0)).unwrap();

        let view = registry.motor_by_index(2).unwrap();
        assert_eq!(view.params.kp, 2.0);
        assert_eq!(view.params.setpoint, 40.0);
        assert_eq!(view.params.ki, 0.2);
        assert_eq!(view.params.kd, 0.1);
        assert!(view.dirty);
    }

    #[test]
    fn test_setpoint_pushed_end_to_end() {
        let board = Board::new();
        board.set_fail_open(true);
        let mut registry = registry_with(&[("P1", &board)]);
        registry.add_link("P1", 1_000_000).unwrap();

        registry.update_motor(1, ParamsUpdate::setpoint(120.0)).unwrap();
        let view = registry.motor_by_index(1).unwrap();
        assert_eq!(view.params.setpoint, 120.0);
        assert!(view.dirty);

        board.set_fail_open(false);
        assert!(wait_until(|| !board.updates().is_empty()));
        assert!(wait_until(|| !registry.motor_by_index(1).unwrap().dirty));

        let expected = codec::encode_update(
            0,
            &MotorParams {
                setpoint: 120.0,
                ..MotorParams::default()
            },
        );
        assert_eq!(board.updates()[0], expected);
        assert_eq!(board.updates()[0][0], b'&');

        registry.stop_all();
    }

    #[test]
    fn test_snapshot_reads_cached_telemetry() {
        let a = Board::new();
        let b = Board::new();
        a.set_telemetry(0, Telemetry::from_array([100.0, 0.0, 0.0, 0.0, 0.0, 0.0]));
        b.set_telemetry(1, Telemetry::from_array([300.0, 1.0, 2.0, 3.0, 4.0, 5.0]));
        let mut registry = registry_with(&[("A", &a), ("B", &b)]);
        registry.add_link("A", 1_000_000).unwrap();
        registry.add_link("B", 1_000_000).unwrap();

        assert!(wait_until(|| registry.motors_all().values().all(|v| v.sampled_at.is_some())));
        registry.stop_all();

        let snapshot = registry.snapshot_all();
        assert_eq!(snapshot.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(snapshot[&1].rpm, 100.0);
        assert_eq!(snapshot[&4].as_array(), [300.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(average_speed(&snapshot), 200.0);
    }

    #[test]
    fn test_broadcast_setpoint() {
        let a = Board::new();
        a.set_fail_open(true);
        let mut registry = registry_with(&[("A", &a)]);
        registry.add_link("A", 1_000_000).unwrap();

        registry.update_all_setpoints(75.0);
        let params = registry.params_all();
        assert_eq!(params.len(), 2);
        assert!(params.values().all(|p| p.setpoint == 75.0));
        assert!(registry.motors_all().values().all(|v| v.dirty));
    }

    #[test]
    fn test_load_from_config_applies_declared_fields() {
        let board = Board::new();
        board.set_fail_open(true);
        let mut registry = registry_with(&[("P1", &board)]);

        let config = loader::parse(r#"{"P1": {"1": {"kp": 2.0, "ki": 0.5}}}"#).unwrap();
        let report = registry.load_from_config(&config);

        assert!(report.is_clean());
        assert_eq!(report.links.len(), 1);
        let view = registry.motor_by_index(1).unwrap();
        assert_eq!(view.params.kp, 2.0);
        assert_eq!(view.params.ki, 0.5);
        assert_eq!(view.params.kd, 0.0);
        assert_eq!(view.params.setpoint, 0.0);
        assert_eq!(registry.motor_by_index(2).unwrap().params, MotorParams::default());
    }

    #[test]
    fn test_load_from_config_reports_and_continues() {
        let good = Board::new();
        good.set_fail_open(true);
        let mut registry = registry_with(&[("GOOD", &good)]);

        let config = loader::parse(
            r#"{
                "MISSING": {"1": {"kp": 1.0}},
                "GOOD": {"3": {"kp": 9.0}, "2": {"SetPoint": 60.0}}
            }"#,
        )
        .unwrap();
        let report = registry.load_from_config(&config);

        assert_eq!(registry.ports(), vec!["GOOD"]);
        assert!(!report.is_clean());
        assert_eq!(report.issues.len(), 3);
        assert!(matches!(&report.issues[0], LoadIssue::Link { port, .. } if port == "MISSING"));
        assert_eq!(registry.motor_by_index(2).unwrap().params.setpoint, 60.0);
        assert_eq!(registry.motor_by_index(1).unwrap().params.kp, 0.0);
    }

    #[test]
    fn test_stop_all_joins_workers() {
        let board = Board::new();
        let mut registry = registry_with(&[("P1", &board)]);
        registry.add_link("P1", 1_000_000).unwrap();
        assert!(wait_until(|| board.polls() > 0));

        registry.stop_all();
        let polls = board.polls();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(board.polls(), polls);
    }
}
