//! Per-concern reactions to registry events
//!
//! Each handler is a pure function from an event (plus a snapshot of local
//! state) to at most one [`Action`]. The dispatcher runs every handler on
//! every event, so one event may yield several actions. Handlers must stay
//! correct under duplicate delivery and make no assumption about ordering
//! across paths.

use crate::config::JobConfig;
use crate::coordinator::SERVER_DISABLED;
use crate::models::JobInstance;
use crate::node::JobNodePath;
use crate::registry::{EventKind, RegistryEvent};

/// What the dispatcher should do in response to an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Mark the job as needing resharding
    SetReshardingFlag,
    /// Install a configuration observed in an event
    RefreshConfig(Box<JobConfig>),
    /// The configuration node disappeared
    InvalidateConfig,
    /// Clean up after a peer whose instance node vanished
    CrashFailover { instance_id: String },
    /// Failover was turned off
    RemoveFailoverInfo,
    /// A leader latch vanished or the local server came back into rotation
    ElectLeader,
    /// The local server was disabled; give the latch up
    LeaveElection,
    /// Execution monitoring was turned off
    ClearRunningInfo,
    /// Misfire handling was turned off
    ClearMisfireInfo,
    /// The local instance node vanished while the process keeps running
    ReRegisterInstance,
}

impl Action {
    /// Short name used in logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetReshardingFlag => "set_resharding_flag",
            Self::RefreshConfig(_) => "refresh_config",
            Self::InvalidateConfig => "invalidate_config",
            Self::CrashFailover { .. } => "crash_failover",
            Self::RemoveFailoverInfo => "remove_failover_info",
            Self::ElectLeader => "elect_leader",
            Self::LeaveElection => "leave_election",
            Self::ClearRunningInfo => "clear_running_info",
            Self::ClearMisfireInfo => "clear_misfire_info",
            Self::ReRegisterInstance => "re_register_instance",
        }
    }
}

/// Local state the handlers read
#[derive(Debug, Clone, Copy)]
pub struct ListenerContext<'a> {
    pub path: &'a JobNodePath,
    pub local_instance: &'a JobInstance,
    /// Configuration known before this event
    pub current_config: Option<&'a JobConfig>,
    pub shutting_down: bool,
}

/// Signature shared by all handlers
pub type Handler = fn(&RegistryEvent, &ListenerContext<'_>) -> Option<Action>;

/// Every handler in dispatch order
pub const HANDLERS: &[Handler] = &[
    config_cache,
    sharding_total_count_changed,
    instance_membership_changed,
    server_changed,
    local_server_changed,
    crash_failover,
    local_instance_removed,
    failover_settings_changed,
    leader_latch_removed,
    monitor_execution_changed,
    misfire_settings_changed,
];

/// Run every handler over one event
pub fn actions_for(event: &RegistryEvent, ctx: &ListenerContext<'_>) -> Vec<Action> {
    HANDLERS.iter().filter_map(|handler| handler(event, ctx)).collect()
}

/// New configuration carried by a config update, if it parses
fn updated_config(event: &RegistryEvent, ctx: &ListenerContext<'_>) -> Option<JobConfig> {
    if !ctx.path.is_config_path(&event.path) || event.kind == EventKind::Removed {
        return None;
    }
    JobConfig::from_json(event.data.as_deref()?).ok()
}

/// Compare a setting of the previous and the new configuration
fn config_transition<T: PartialEq>(
    event: &RegistryEvent,
    ctx: &ListenerContext<'_>,
    field: impl Fn(&JobConfig) -> T,
) -> Option<(T, T)> {
    let previous = field(ctx.current_config?);
    let next = field(&updated_config(event, ctx)?);
    (previous != next).then_some((previous, next))
}

// ============================================================================
// Configuration
// ============================================================================

/// Keep the local configuration cache in step with the registry
pub fn config_cache(event: &RegistryEvent, ctx: &ListenerContext<'_>) -> Option<Action> {
    if !ctx.path.is_config_path(&event.path) {
        return None;
    }
    match event.kind {
        EventKind::Removed => Some(Action::InvalidateConfig),
        _ => updated_config(event, ctx).map(|c| Action::RefreshConfig(Box::new(c))),
    }
}

/// A new total count or strategy invalidates the assignment
pub fn sharding_total_count_changed(
    event: &RegistryEvent,
    ctx: &ListenerContext<'_>,
) -> Option<Action> {
    let count_changed = config_transition(event, ctx, |c| c.sharding_total_count).is_some();
    let strategy_changed =
        config_transition(event, ctx, |c| c.job_sharding_strategy_type.clone()).is_some();
    (count_changed || strategy_changed).then_some(Action::SetReshardingFlag)
}

pub fn failover_settings_changed(
    event: &RegistryEvent,
    ctx: &ListenerContext<'_>,
) -> Option<Action> {
    match config_transition(event, ctx, |c| c.failover)? {
        (true, false) => Some(Action::RemoveFailoverInfo),
        _ => None,
    }
}

pub fn monitor_execution_changed(
    event: &RegistryEvent,
    ctx: &ListenerContext<'_>,
) -> Option<Action> {
    match config_transition(event, ctx, |c| c.monitor_execution)? {
        (true, false) => Some(Action::ClearRunningInfo),
        _ => None,
    }
}

pub fn misfire_settings_changed(
    event: &RegistryEvent,
    ctx: &ListenerContext<'_>,
) -> Option<Action> {
    match config_transition(event, ctx, |c| c.misfire)? {
        (true, false) => Some(Action::ClearMisfireInfo),
        _ => None,
    }
}

// ============================================================================
// Membership
// ============================================================================

/// Instances joining or leaving change the assignment
pub fn instance_membership_changed(
    event: &RegistryEvent,
    ctx: &ListenerContext<'_>,
) -> Option<Action> {
    if ctx.shutting_down || event.kind == EventKind::Updated {
        return None;
    }
    ctx.path
        .instance_id_from_path(&event.path)
        .map(|_| Action::SetReshardingFlag)
}

/// Server enable/disable changes the set of available instances
pub fn server_changed(event: &RegistryEvent, ctx: &ListenerContext<'_>) -> Option<Action> {
    if ctx.shutting_down || event.kind == EventKind::Removed {
        return None;
    }
    ctx.path
        .server_ip_from_path(&event.path)
        .map(|_| Action::SetReshardingFlag)
}

/// The local server left or re-entered rotation
pub fn local_server_changed(event: &RegistryEvent, ctx: &ListenerContext<'_>) -> Option<Action> {
    if ctx.shutting_down || event.kind == EventKind::Removed {
        return None;
    }
    if ctx.path.server_ip_from_path(&event.path)? != ctx.local_instance.server_ip() {
        return None;
    }
    if event.data_or_empty() == SERVER_DISABLED {
        Some(Action::LeaveElection)
    } else {
        Some(Action::ElectLeader)
    }
}

/// A peer's instance node vanished: recover what it was running
pub fn crash_failover(event: &RegistryEvent, ctx: &ListenerContext<'_>) -> Option<Action> {
    if ctx.shutting_down || event.kind != EventKind::Removed {
        return None;
    }
    let instance_id = ctx.path.instance_id_from_path(&event.path)?;
    (instance_id != ctx.local_instance.id()).then(|| Action::CrashFailover {
        instance_id: instance_id.to_string(),
    })
}

/// The local instance node vanished although the process is not shutting down
pub fn local_instance_removed(event: &RegistryEvent, ctx: &ListenerContext<'_>) -> Option<Action> {
    if ctx.shutting_down || event.kind != EventKind::Removed {
        return None;
    }
    (ctx.path.instance_id_from_path(&event.path)? == ctx.local_instance.id())
        .then_some(Action::ReRegisterInstance)
}

/// A latch vanished; the leader may be gone
pub fn leader_latch_removed(event: &RegistryEvent, ctx: &ListenerContext<'_>) -> Option<Action> {
    if ctx.shutting_down || event.kind != EventKind::Removed {
        return None;
    }
    ctx.path
        .latch_from_path(&event.path)
        .map(|_| Action::ElectLeader)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(count: u32, failover: bool, misfire: bool, monitor: bool) -> JobConfig {
        JobConfig::builder("job", "0 * * * * ?", count)
            .failover(failover)
            .misfire(misfire)
            .monitor_execution(monitor)
            .build()
            .unwrap()
    }

    struct Fixture {
        path: JobNodePath,
        local: JobInstance,
        config: JobConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                path: JobNodePath::new("job"),
                local: JobInstance::new("10.0.0.1", 1),
                config: config(3, true, true, true),
            }
        }

        fn ctx(&self, shutting_down: bool) -> ListenerContext<'_> {
            ListenerContext {
                path: &self.path,
                local_instance: &self.local,
                current_config: Some(&self.config),
                shutting_down,
            }
        }
    }

    fn config_event(config: &JobConfig) -> RegistryEvent {
        RegistryEvent::new(
            EventKind::Updated,
            "/job/config",
            Some(config.to_json().unwrap()),
        )
    }

    #[test]
    fn test_total_count_change_reshards() {
        let f = Fixture::new();
        let actions = actions_for(&config_event(&config(5, true, true, true)), &f.ctx(false));
        assert!(actions.contains(&Action::SetReshardingFlag));
        assert!(matches!(actions[0], Action::RefreshConfig(_)));
    }

    #[test]
    fn test_unchanged_config_only_refreshes() {
        let f = Fixture::new();
        let actions = actions_for(&config_event(&f.config), &f.ctx(false));
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], Action::RefreshConfig(_)));
    }

    #[test]
    fn test_settings_turned_off() {
        let f = Fixture::new();
        let actions = actions_for(&config_event(&config(3, false, false, false)), &f.ctx(false));
        assert!(actions.contains(&Action::RemoveFailoverInfo));
        assert!(actions.contains(&Action::ClearMisfireInfo));
        assert!(actions.contains(&Action::ClearRunningInfo));
        assert!(!actions.contains(&Action::SetReshardingFlag));
    }

    #[test]
    fn test_unparseable_config_ignored() {
        let f = Fixture::new();
        let event = RegistryEvent::new(EventKind::Updated, "/job/config", Some("{".to_string()));
        assert!(actions_for(&event, &f.ctx(false)).is_empty());
    }

    #[test]
    fn test_config_removed_invalidates() {
        let f = Fixture::new();
        let event = RegistryEvent::new(EventKind::Removed, "/job/config", None);
        assert_eq!(actions_for(&event, &f.ctx(false)), vec![Action::InvalidateConfig]);
    }

    #[test]
    fn test_peer_crash() {
        let f = Fixture::new();
        let event = RegistryEvent::new(
            EventKind::Removed,
            "/job/instances/10.0.0.2@-@7",
            Some("10.0.0.2".to_string()),
        );
        let actions = actions_for(&event, &f.ctx(false));
        assert_eq!(
            actions,
            vec![
                Action::SetReshardingFlag,
                Action::CrashFailover {
                    instance_id: "10.0.0.2@-@7".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_local_instance_removed_re_registers() {
        let f = Fixture::new();
        let event = RegistryEvent::new(EventKind::Removed, "/job/instances/10.0.0.1@-@1", None);
        let actions = actions_for(&event, &f.ctx(false));
        assert_eq!(
            actions,
            vec![Action::SetReshardingFlag, Action::ReRegisterInstance]
        );
    }

    #[test]
    fn test_shutting_down_suppresses_membership_actions() {
        let f = Fixture::new();
        let event = RegistryEvent::new(EventKind::Removed, "/job/instances/10.0.0.1@-@1", None);
        assert!(actions_for(&event, &f.ctx(true)).is_empty());
    }

    #[test]
    fn test_instance_added_reshards() {
        let f = Fixture::new();
        let event = RegistryEvent::new(EventKind::Added, "/job/instances/10.0.0.3@-@1", None);
        assert_eq!(actions_for(&event, &f.ctx(false)), vec![Action::SetReshardingFlag]);
    }

    #[test]
    fn test_server_disabled_reshards() {
        let f = Fixture::new();
        let event = RegistryEvent::new(
            EventKind::Updated,
            "/job/servers/10.0.0.2",
            Some("DISABLED".to_string()),
        );
        assert_eq!(actions_for(&event, &f.ctx(false)), vec![Action::SetReshardingFlag]);
    }

    #[test]
    fn test_local_server_disabled_leaves_election() {
        let f = Fixture::new();
        let event = RegistryEvent::new(
            EventKind::Updated,
            "/job/servers/10.0.0.1",
            Some("DISABLED".to_string()),
        );
        assert_eq!(
            actions_for(&event, &f.ctx(false)),
            vec![Action::SetReshardingFlag, Action::LeaveElection]
        );
    }

    #[test]
    fn test_local_server_enabled_rejoins_election() {
        let f = Fixture::new();
        let event = RegistryEvent::new(
            EventKind::Updated,
            "/job/servers/10.0.0.1",
            Some(String::new()),
        );
        assert_eq!(
            actions_for(&event, &f.ctx(false)),
            vec![Action::SetReshardingFlag, Action::ElectLeader]
        );
        assert!(actions_for(&event, &f.ctx(true)).is_empty());
    }

    #[test]
    fn test_latch_removed_elects() {
        let f = Fixture::new();
        let event = RegistryEvent::new(
            EventKind::Removed,
            "/job/leader/election/latch/0000000000",
            None,
        );
        assert_eq!(actions_for(&event, &f.ctx(false)), vec![Action::ElectLeader]);
    }

    #[test]
    fn test_unrelated_paths_ignored() {
        let f = Fixture::new();
        for path in ["/job/sharding/0/running", "/job/failover/job/1", "/other/instances/x"] {
            let event = RegistryEvent::new(EventKind::Removed, path, None);
            assert!(actions_for(&event, &f.ctx(false)).is_empty(), "{}", path);
        }
    }
}
