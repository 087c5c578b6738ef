use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use transport::core_location::CoreLocation;
use transport::device_access::DeviceAccess;
use transport::monitor::{ReinjectionControllable, ReinjectionFlags, ReinjectionStatus, RouterTimeout, RouterWait};

/// The routers' configuration for the duration of bulk streaming: system routes, no reinjection
///  and long timeouts. [StreamingGuard::exit] switches back to the application's configuration
///  and restores the settings that were active before.
pub struct StreamingGuard {
    monitor: Arc<dyn ReinjectionControllable>,
    device: Arc<dyn DeviceAccess>,
    monitor_cores: Vec<CoreLocation>,
    saved: ReinjectionStatus,
}

impl StreamingGuard {
    /// `monitor_cores` are only used to read their state if switching back fails
    pub async fn enter(
        monitor: Arc<dyn ReinjectionControllable>,
        device: Arc<dyn DeviceAccess>,
        monitor_cores: Vec<CoreLocation>,
    ) -> anyhow::Result<StreamingGuard> {
        monitor.install_system_routes().await?;

        let saved = monitor.reinjection_status().await?;
        debug!("saved reinjection status: {:?}", saved);

        let guard = StreamingGuard { monitor, device, monitor_cores, saved };
        if let Err(e) = guard.configure_for_streaming().await {
            error!("error configuring the routers for data streaming: {}", e);
            guard.log_core_states().await;
            return Err(e);
        }
        info!("routers configured for data streaming");
        Ok(guard)
    }

    fn add_monitor_cores(&mut self, cores: &[CoreLocation]) {
        for &core in cores {
            if !self.monitor_cores.contains(&core) {
                self.monitor_cores.push(core);
            }
        }
    }

    async fn configure_for_streaming(&self) -> anyhow::Result<()> {
        self.monitor.set_reinjection(ReinjectionFlags::empty()).await?;
        self.monitor.clear_reinjection_queue().await?;
        self.monitor.set_router_timeout(RouterWait::Wait2, RouterTimeout::SHORT).await?;
        self.monitor.set_router_timeout(RouterWait::Wait1, RouterTimeout::LONG).await?;
        Ok(())
    }

    async fn restore(&self) -> anyhow::Result<()> {
        self.monitor.set_router_timeout(RouterWait::Wait1, RouterTimeout::TEMP).await?;
        self.monitor.set_router_timeout(RouterWait::Wait2, RouterTimeout::ZERO).await?;

        self.monitor.set_router_timeout(RouterWait::Wait1, self.saved.wait1_timeout).await?;
        self.monitor.set_router_timeout(RouterWait::Wait2, self.saved.wait2_timeout).await?;
        self.monitor.set_reinjection(self.saved.flags).await?;
        Ok(())
    }

    async fn log_core_states(&self) {
        error!("checking if the monitor cores are OK");
        for &core in &self.monitor_cores {
            match self.device.read_core_state(core).await {
                Ok(state) => error!("monitor core state: {}", state),
                Err(e) => warn!("could not read the state of {}: {}", core, e),
            }
        }
    }

    /// Switches back to the application's routes. A failure to restore the saved settings is
    ///  logged together with the monitor cores' state, and returned.
    pub async fn exit(self) -> anyhow::Result<()> {
        let restored = self.restore().await;
        if let Err(e) = &restored {
            error!("error resetting the router timeouts: {}", e);
            self.log_core_states().await;
        }

        let routes = self.monitor.install_application_routes().await;
        if restored.is_ok() && routes.is_ok() {
            info!("routers restored after data streaming");
        }
        restored.and(routes)
    }
}

#[derive(Default)]
struct ScopeState {
    active: usize,
    guard: Option<StreamingGuard>,
}

/// Streaming configuration shared by sessions that may overlap: the first session to enter
///  configures the routers, the last one to leave restores them.
pub struct StreamingScope {
    monitor: Arc<dyn ReinjectionControllable>,
    device: Arc<dyn DeviceAccess>,
    state: Mutex<ScopeState>,
}

impl StreamingScope {
    pub fn new(monitor: Arc<dyn ReinjectionControllable>, device: Arc<dyn DeviceAccess>) -> StreamingScope {
        StreamingScope {
            monitor,
            device,
            state: Default::default(),
        }
    }

    pub async fn enter(&self, monitor_cores: &[CoreLocation]) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        match &mut state.guard {
            Some(guard) => guard.add_monitor_cores(monitor_cores),
            None => {
                let guard = StreamingGuard::enter(self.monitor.clone(), self.device.clone(), monitor_cores.to_vec()).await?;
                state.guard = Some(guard);
            }
        }
        state.active += 1;
        Ok(())
    }

    pub async fn exit(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.active = state.active.saturating_sub(1);
        if state.active > 0 {
            return Ok(());
        }
        match state.guard.take() {
            Some(guard) => guard.exit().await,
            None => Ok(()),
        }
    }

    /// Runs `f` with the routers configured for streaming, switching back afterwards regardless
    ///  of `f`'s outcome. An error of `f` takes precedence over a failure to switch back.
    pub async fn run<F, T, E>(&self, monitor_cores: &[CoreLocation], f: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<anyhow::Error>,
    {
        self.enter(monitor_cores).await?;
        let result = f.await;
        let restored = self.exit().await;
        match (result, restored) {
            (Ok(_), Err(e)) => Err(e.into()),
            (result, _) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use transport::test_util::{MonitorCall, SimulatedMachine};
    use super::*;

    const MONITOR: CoreLocation = CoreLocation { x: 0, y: 0, p: 0 };

    fn scope(machine: &SimulatedMachine) -> StreamingScope {
        StreamingScope::new(Arc::new(machine.clone()), Arc::new(machine.clone()))
    }

    /// the monitor calls of one complete bracket, starting from the given settings
    fn bracket_calls(before: (RouterTimeout, RouterTimeout), flags_before: ReinjectionFlags) -> Vec<MonitorCall> {
        vec![
            MonitorCall::InstallSystemRoutes,
            MonitorCall::ReinjectionStatus,
            MonitorCall::SetReinjection(ReinjectionFlags::empty()),
            MonitorCall::ClearReinjectionQueue,
            MonitorCall::SetRouterTimeout(RouterWait::Wait2, RouterTimeout::SHORT),
            MonitorCall::SetRouterTimeout(RouterWait::Wait1, RouterTimeout::LONG),
            MonitorCall::SetRouterTimeout(RouterWait::Wait1, RouterTimeout::TEMP),
            MonitorCall::SetRouterTimeout(RouterWait::Wait2, RouterTimeout::ZERO),
            MonitorCall::SetRouterTimeout(RouterWait::Wait1, before.0),
            MonitorCall::SetRouterTimeout(RouterWait::Wait2, before.1),
            MonitorCall::SetReinjection(flags_before),
            MonitorCall::InstallApplicationRoutes,
        ]
    }

    #[tokio::test]
    async fn test_bracket_sequence() {
        let machine = SimulatedMachine::new(272);
        let before = machine.router_timeouts();
        let flags_before = machine.reinjection_flags();

        let inside = scope(&machine).run(&[MONITOR], async {
            Ok::<_, anyhow::Error>((machine.router_timeouts(), machine.reinjection_flags()))
        }).await.unwrap();
        assert_eq!(inside, ((RouterTimeout::LONG, RouterTimeout::SHORT), ReinjectionFlags::empty()));

        assert_eq!(machine.router_timeouts(), before);
        assert_eq!(machine.reinjection_flags(), flags_before);

        assert_eq!(machine.stats().monitor_calls, bracket_calls(before, flags_before));
        assert_eq!(machine.stats().core_state_reads, 0);
    }

    #[tokio::test]
    async fn test_nested_entries_share_one_bracket() {
        let machine = SimulatedMachine::new(272);
        let before = machine.router_timeouts();
        let flags_before = machine.reinjection_flags();
        let scope = scope(&machine);

        scope.enter(&[MONITOR]).await.unwrap();
        scope.enter(&[CoreLocation::new(1, 0, 0)]).await.unwrap();
        scope.exit().await.unwrap();
        assert_eq!(machine.router_timeouts(), (RouterTimeout::LONG, RouterTimeout::SHORT));

        scope.exit().await.unwrap();
        assert_eq!(machine.router_timeouts(), before);
        assert_eq!(machine.stats().monitor_calls, bracket_calls(before, flags_before));
    }

    #[tokio::test]
    async fn test_restored_after_failure() {
        let machine = SimulatedMachine::new(272);
        let before = machine.router_timeouts();

        let result = scope(&machine).run(&[MONITOR], async {
            Err::<(), _>(anyhow::anyhow!("session failed"))
        }).await;
        assert_eq!(result.unwrap_err().to_string(), "session failed");
        assert_eq!(machine.router_timeouts(), before);
        assert_eq!(machine.stats().monitor_calls.last(), Some(&MonitorCall::InstallApplicationRoutes));
    }

    #[tokio::test]
    async fn test_failed_restore_reads_core_state() {
        let machine = SimulatedMachine::new(272);
        let scope = scope(&machine);
        scope.enter(&[MONITOR]).await.unwrap();
        scope.enter(&[MONITOR, CoreLocation::new(1, 0, 0)]).await.unwrap();

        machine.set_fail_monitor_calls(true);
        scope.exit().await.unwrap();
        assert!(scope.exit().await.is_err());
        assert_eq!(machine.stats().core_state_reads, 2);
    }

    #[tokio::test]
    async fn test_failed_enter() {
        let machine = SimulatedMachine::new(272);
        machine.set_fail_monitor_calls(true);
        let scope = scope(&machine);
        let result = scope.run(&[MONITOR], async { Ok::<_, anyhow::Error>(1) }).await;
        assert!(result.is_err());

        // a failed entry leaves nothing to restore
        machine.set_fail_monitor_calls(false);
        let calls = machine.stats().monitor_calls.len();
        scope.exit().await.unwrap();
        assert_eq!(machine.stats().monitor_calls.len(), calls);
    }
}
