//! Public status endpoint with the typed machine-state mirror.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use machinetalk_proto::{
    Container, ContainerType, EmcStatusConfig, EmcStatusInterp, EmcStatusIo, EmcStatusMotion,
    EmcStatusTask, InterpreterState, TaskMode,
};

use crate::application::mirror::MergeUpdate;
use crate::base::status::StatusBase;
use crate::channel::ObserverSet;
use crate::discovery::{Service, ServiceContainer};
use crate::sync::{deadline_after, wait_until};
use crate::Result;

/// The five status topics a machine publishes.
const STATUS_TOPICS: [&str; 5] = ["motion", "config", "io", "task", "interp"];

/// Client for the machine status service.
///
/// Mirrors the five per-topic state trees. Each tree sits behind its own
/// lock and condition variable, so readers always see a stable snapshot
/// of one tree; the aggregate [`synced`](Self::synced) flag flips true
/// once every topic delivered its full snapshot.
pub struct ApplicationStatus {
    base: StatusBase,
    services: ServiceContainer,
    status_service: Service,
    shared: Arc<StatusShared>,
}

struct StatusShared {
    motion: TreeCell<EmcStatusMotion>,
    config: TreeCell<EmcStatusConfig>,
    io: TreeCell<EmcStatusIo>,
    task: TreeCell<EmcStatusTask>,
    interp: TreeCell<EmcStatusInterp>,
    synced: Mutex<bool>,
    synced_condvar: Condvar,
    running: AtomicBool,
    synced_observers: ObserverSet<bool>,
}

/// One mirrored sub-tree plus the condition variable its readers block
/// on.
struct TreeCell<T> {
    data: Mutex<T>,
    condvar: Condvar,
}

impl<T: Clone + Default + MergeUpdate> TreeCell<T> {
    fn new() -> Self {
        TreeCell {
            data: Mutex::new(T::default()),
            condvar: Condvar::new(),
        }
    }

    fn snapshot(&self) -> T {
        self.data.lock().expect("status tree poisoned").clone()
    }

    /// Full update: the tree is replaced wholesale.
    fn replace(&self, value: T) {
        *self.data.lock().expect("status tree poisoned") = value;
        self.condvar.notify_all();
    }

    /// Incremental update: only present fields are applied.
    fn merge(&self, update: &T) {
        self.data
            .lock()
            .expect("status tree poisoned")
            .merge_update(update);
        self.condvar.notify_all();
    }

    /// Block until this tree is touched by any update.
    fn wait_updated(&self, timeout: Option<Duration>) -> bool {
        let deadline = deadline_after(timeout);
        let guard = self.data.lock().expect("status tree poisoned");
        let (_guard, deadline_reached) = wait_until(&self.condvar, guard, deadline);
        !deadline_reached
    }
}

impl ApplicationStatus {
    pub fn new() -> Result<Self> {
        let base = StatusBase::new("application")?;
        for topic in STATUS_TOPICS {
            base.add_topic(topic);
        }
        let shared = Arc::new(StatusShared {
            motion: TreeCell::new(),
            config: TreeCell::new(),
            io: TreeCell::new(),
            task: TreeCell::new(),
            interp: TreeCell::new(),
            synced: Mutex::new(false),
            synced_condvar: Condvar::new(),
            running: AtomicBool::new(false),
            synced_observers: ObserverSet::new(),
        });

        let update_target = Arc::clone(&shared);
        base.on_message_received(move |message| {
            update_target.status_update(&message.0, &message.1);
        });
        let sync_target = Arc::clone(&shared);
        base.on_sync_changed(move |synced| {
            sync_target.update_synced(*synced);
        });

        let status_service = Service::new("status");
        let services = ServiceContainer::new();
        services.add_service(&status_service);
        let ready_base = base.clone();
        let ready_service = status_service.clone();
        services.on_services_ready_changed(move |ready| {
            ready_base.set_uri(&ready_service.uri());
            if *ready {
                ready_base.start();
            } else {
                ready_base.stop();
            }
        });

        Ok(ApplicationStatus {
            base,
            services,
            status_service,
            shared,
        })
    }

    pub fn services(&self) -> &ServiceContainer {
        &self.services
    }

    pub fn status_service(&self) -> &Service {
        &self.status_service
    }

    /// Point the endpoint at a fixed URI instead of discovery.
    pub fn set_status_uri(&self, uri: &str) {
        self.base.set_uri(uri);
    }

    /// Subscribe without discovery. Idempotent.
    pub fn start(&self) {
        self.base.start();
    }

    /// Idempotent.
    pub fn stop(&self) {
        self.base.stop();
    }

    pub fn state(&self) -> crate::StatusState {
        self.base.state()
    }

    /// True while every topic's full update has been received and the
    /// subscription is fresh.
    pub fn synced(&self) -> bool {
        *self.shared.synced.lock().expect("synced poisoned")
    }

    /// Task is in auto or MDI mode with the interpreter idle.
    pub fn running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn on_synced_changed(&self, observer: impl Fn(&bool) + Send + Sync + 'static) {
        self.shared.synced_observers.subscribe(observer);
    }

    // snapshot accessors; each holds its tree lock for the copy only

    pub fn motion(&self) -> EmcStatusMotion {
        self.shared.motion.snapshot()
    }

    pub fn config(&self) -> EmcStatusConfig {
        self.shared.config.snapshot()
    }

    pub fn io(&self) -> EmcStatusIo {
        self.shared.io.snapshot()
    }

    pub fn task(&self) -> EmcStatusTask {
        self.shared.task.snapshot()
    }

    pub fn interp(&self) -> EmcStatusInterp {
        self.shared.interp.snapshot()
    }

    /// Block until every topic delivered its full update.
    pub fn wait_synced(&self, timeout: Option<Duration>) -> bool {
        let deadline = deadline_after(timeout);
        let mut synced = self.shared.synced.lock().expect("synced poisoned");
        loop {
            if *synced {
                return true;
            }
            let (guard, deadline_reached) =
                wait_until(&self.shared.synced_condvar, synced, deadline);
            synced = guard;
            if deadline_reached {
                return *synced;
            }
        }
    }

    pub fn wait_motion_updated(&self, timeout: Option<Duration>) -> bool {
        self.shared.motion.wait_updated(timeout)
    }

    pub fn wait_config_updated(&self, timeout: Option<Duration>) -> bool {
        self.shared.config.wait_updated(timeout)
    }

    pub fn wait_io_updated(&self, timeout: Option<Duration>) -> bool {
        self.shared.io.wait_updated(timeout)
    }

    pub fn wait_task_updated(&self, timeout: Option<Duration>) -> bool {
        self.shared.task.wait_updated(timeout)
    }

    pub fn wait_interp_updated(&self, timeout: Option<Duration>) -> bool {
        self.shared.interp.wait_updated(timeout)
    }
}

impl Drop for ApplicationStatus {
    fn drop(&mut self) {
        self.base.stop();
    }
}

impl StatusShared {
    fn status_update(&self, topic: &str, rx: &Container) {
        let full = rx.container_type() == Some(ContainerType::MtEmcstatFullUpdate);
        match topic {
            "motion" => {
                if let Some(update) = &rx.emc_status_motion {
                    if full {
                        self.motion.replace(update.clone());
                    } else {
                        self.motion.merge(update);
                    }
                }
            }
            "config" => {
                if let Some(update) = &rx.emc_status_config {
                    if full {
                        self.config.replace(update.clone());
                    } else {
                        self.config.merge(update);
                    }
                }
            }
            "io" => {
                if let Some(update) = &rx.emc_status_io {
                    if full {
                        self.io.replace(update.clone());
                    } else {
                        self.io.merge(update);
                    }
                }
            }
            "task" => {
                if let Some(update) = &rx.emc_status_task {
                    if full {
                        self.task.replace(update.clone());
                    } else {
                        self.task.merge(update);
                    }
                    self.update_running();
                }
            }
            "interp" => {
                if let Some(update) = &rx.emc_status_interp {
                    if full {
                        self.interp.replace(update.clone());
                    } else {
                        self.interp.merge(update);
                    }
                    self.update_running();
                }
            }
            _ => {}
        }
    }

    /// `running` is derived from both the task and interp trees; the
    /// trees are sampled one at a time, never locked together.
    fn update_running(&self) {
        let task_mode = self.task.snapshot().task_mode;
        let interp_state = self.interp.snapshot().interp_state;
        let mode_active = matches!(
            task_mode,
            Some(mode)
                if mode == TaskMode::EmcTaskModeAuto as i32
                    || mode == TaskMode::EmcTaskModeMdi as i32
        );
        let running = mode_active
            && interp_state == Some(InterpreterState::EmcTaskInterpIdle as i32);
        self.running.store(running, Ordering::SeqCst);
    }

    fn update_synced(&self, synced: bool) {
        {
            let mut current = self.synced.lock().expect("synced poisoned");
            *current = synced;
            self.synced_condvar.notify_all();
        }
        self.synced_observers.notify(&synced);
    }
}
