//! Public command endpoint.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use machinetalk_proto::{
    Container, ContainerType, EmcCommandParameters, Position, TaskMode, TaskState, ToolData,
    TrajectoryMode,
};

use crate::base::command::CommandBase;
use crate::channel::ObserverSet;
use crate::discovery::{Service, ServiceContainer};
use crate::sync::{deadline_after, wait_until};
use crate::Result;

/// Interpreter addressed by task commands unless overridden.
const DEFAULT_INTERPRETER: &str = "execute";

/// Jog sub-kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JogType {
    Stop,
    Continuous,
    Increment,
}

/// Spindle operation selected by [`ApplicationCommand::set_spindle`].
///
/// Forward and reverse share a wire kind and differ only by the sign of
/// the velocity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpindleMode {
    Forward,
    Reverse,
    Off,
    Increase,
    Decrease,
    Constant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpindleBrake {
    Engage,
    Release,
}

/// Client for the machine command service.
///
/// Every command allocates a monotonically increasing ticket under the
/// transmit lock and returns it; the server echoes the ticket in its
/// `EMCCMD_EXECUTED` and `EMCCMD_COMPLETED` replies, which
/// [`wait_executed`](Self::wait_executed) and
/// [`wait_completed`](Self::wait_completed) block on. Commands issued
/// while not connected return `None`; use
/// [`wait_connected`](Self::wait_connected) to avoid that.
pub struct ApplicationCommand {
    base: CommandBase,
    services: ServiceContainer,
    command_service: Service,
    shared: Arc<CommandShared>,
}

struct CommandShared {
    connected: Mutex<bool>,
    connected_condvar: Condvar,
    /// Ticket counter; its mutex is the transmit lock.
    ticket: Mutex<u32>,
    executed: Mutex<ReplyState>,
    executed_condvar: Condvar,
    completed: Mutex<ReplyState>,
    completed_condvar: Condvar,
    interp_name: Mutex<String>,
    connected_observers: ObserverSet<bool>,
}

#[derive(Default)]
struct ReplyState {
    ticket: u32,
    /// Counts replies so a `wait_*(None, _)` can detect "the next one".
    sequence: u64,
}

impl ApplicationCommand {
    pub fn new() -> Result<Self> {
        let base = CommandBase::new("application")?;
        let shared = Arc::new(CommandShared {
            connected: Mutex::new(false),
            connected_condvar: Condvar::new(),
            ticket: Mutex::new(0),
            executed: Mutex::new(ReplyState::default()),
            executed_condvar: Condvar::new(),
            completed: Mutex::new(ReplyState::default()),
            completed_condvar: Condvar::new(),
            interp_name: Mutex::new(DEFAULT_INTERPRETER.to_owned()),
            connected_observers: ObserverSet::new(),
        });

        let connected_target = Arc::clone(&shared);
        base.on_connected_changed(move |connected| {
            connected_target.update_connected(*connected);
        });
        let executed_target = Arc::clone(&shared);
        base.on_executed(move |ticket| {
            executed_target.reply_received(
                &executed_target.executed,
                &executed_target.executed_condvar,
                *ticket,
            );
        });
        let completed_target = Arc::clone(&shared);
        base.on_completed(move |ticket| {
            completed_target.reply_received(
                &completed_target.completed,
                &completed_target.completed_condvar,
                *ticket,
            );
        });

        let command_service = Service::new("command");
        let services = ServiceContainer::new();
        services.add_service(&command_service);
        let ready_base = base.clone();
        let ready_service = command_service.clone();
        services.on_services_ready_changed(move |ready| {
            ready_base.set_uri(&ready_service.uri());
            if *ready {
                ready_base.start();
            } else {
                ready_base.stop();
            }
        });

        Ok(ApplicationCommand {
            base,
            services,
            command_service,
            shared,
        })
    }

    /// The service container driving this endpoint; register its
    /// services with a [`crate::discovery::ServiceDiscovery`].
    pub fn services(&self) -> &ServiceContainer {
        &self.services
    }

    pub fn command_service(&self) -> &Service {
        &self.command_service
    }

    /// Point the endpoint at a fixed URI instead of discovery.
    pub fn set_command_uri(&self, uri: &str) {
        self.base.set_uri(uri);
    }

    pub fn command_uri(&self) -> String {
        self.base.uri()
    }

    /// Connect without discovery. Idempotent.
    pub fn start(&self) {
        self.base.start();
    }

    /// Idempotent.
    pub fn stop(&self) {
        self.base.stop();
    }

    pub fn connected(&self) -> bool {
        *self.shared.connected.lock().expect("connected poisoned")
    }

    pub fn state(&self) -> crate::EndpointState {
        self.base.state()
    }

    pub fn error_string(&self) -> String {
        self.base.error_string()
    }

    /// Interpreter name attached to task commands; defaults to
    /// `execute`.
    pub fn set_interpreter_name(&self, name: &str) {
        *self.shared.interp_name.lock().expect("interp name poisoned") = name.to_owned();
    }

    pub fn on_connected_changed(&self, observer: impl Fn(&bool) + Send + Sync + 'static) {
        self.shared.connected_observers.subscribe(observer);
    }

    pub fn on_error_string_changed(&self, observer: impl Fn(&str) + Send + Sync + 'static) {
        self.base.on_error_string_changed(observer);
    }

    /// Last ticket observed on an `EMCCMD_EXECUTED` reply.
    pub fn executed_ticket(&self) -> u32 {
        self.shared.executed.lock().expect("executed poisoned").ticket
    }

    /// Last ticket observed on an `EMCCMD_COMPLETED` reply.
    pub fn completed_ticket(&self) -> u32 {
        self.shared.completed.lock().expect("completed poisoned").ticket
    }

    /// Block until the endpoint is connected.
    pub fn wait_connected(&self, timeout: Option<Duration>) -> bool {
        let deadline = deadline_after(timeout);
        let mut connected = self.shared.connected.lock().expect("connected poisoned");
        loop {
            if *connected {
                return true;
            }
            let (guard, deadline_reached) =
                wait_until(&self.shared.connected_condvar, connected, deadline);
            connected = guard;
            if deadline_reached {
                return *connected;
            }
        }
    }

    /// Block until the command identified by `ticket` was executed.
    ///
    /// `None` waits for the next executed reply of any ticket. Returns
    /// immediately when the reply was already observed; `false` on
    /// timeout.
    pub fn wait_executed(&self, ticket: Option<u32>, timeout: Option<Duration>) -> bool {
        self.shared.wait_reply(
            &self.shared.executed,
            &self.shared.executed_condvar,
            ticket,
            timeout,
        )
    }

    /// Block until the command identified by `ticket` was completed.
    ///
    /// Same contract as [`wait_executed`](Self::wait_executed).
    pub fn wait_completed(&self, ticket: Option<u32>, timeout: Option<Duration>) -> bool {
        self.shared.wait_reply(
            &self.shared.completed,
            &self.shared.completed_condvar,
            ticket,
            timeout,
        )
    }

    // ===== command operations =====

    pub fn abort(&self) -> Option<u32> {
        self.task_command(ContainerType::MtEmcTaskAbort, Container::default())
    }

    pub fn run_program(&self, line_number: i32) -> Option<u32> {
        let mut container = Container::default();
        container.emc_command_params = Some(EmcCommandParameters {
            line_number: Some(line_number),
            ..Default::default()
        });
        self.task_command(ContainerType::MtEmcTaskPlanRun, container)
    }

    pub fn pause_program(&self) -> Option<u32> {
        self.task_command(ContainerType::MtEmcTaskPlanPause, Container::default())
    }

    pub fn step_program(&self) -> Option<u32> {
        self.task_command(ContainerType::MtEmcTaskPlanStep, Container::default())
    }

    pub fn resume_program(&self) -> Option<u32> {
        self.task_command(ContainerType::MtEmcTaskPlanResume, Container::default())
    }

    pub fn reset_program(&self) -> Option<u32> {
        self.task_command(ContainerType::MtEmcTaskPlanInit, Container::default())
    }

    pub fn open_program(&self, file_name: &str) -> Option<u32> {
        let mut container = Container::default();
        container.emc_command_params = Some(EmcCommandParameters {
            path: Some(file_name.to_owned()),
            ..Default::default()
        });
        self.task_command(ContainerType::MtEmcTaskPlanOpen, container)
    }

    pub fn execute_mdi(&self, command: &str) -> Option<u32> {
        let mut container = Container::default();
        container.emc_command_params = Some(EmcCommandParameters {
            command: Some(command.to_owned()),
            ..Default::default()
        });
        self.task_command(ContainerType::MtEmcTaskPlanExecute, container)
    }

    pub fn set_task_mode(&self, mode: TaskMode) -> Option<u32> {
        let mut container = Container::default();
        container.emc_command_params = Some(EmcCommandParameters {
            task_mode: Some(mode as i32),
            ..Default::default()
        });
        self.task_command(ContainerType::MtEmcTaskSetMode, container)
    }

    pub fn set_task_state(&self, state: TaskState) -> Option<u32> {
        let mut container = Container::default();
        container.emc_command_params = Some(EmcCommandParameters {
            task_state: Some(state as i32),
            ..Default::default()
        });
        self.task_command(ContainerType::MtEmcTaskSetState, container)
    }

    pub fn set_debug_level(&self, debug_level: u32) -> Option<u32> {
        let mut container = Container::default();
        container.emc_command_params = Some(EmcCommandParameters {
            debug_level: Some(debug_level),
            ..Default::default()
        });
        self.send_command(ContainerType::MtEmcSetDebug, container)
    }

    pub fn set_spindle_brake(&self, brake: SpindleBrake) -> Option<u32> {
        let kind = match brake {
            SpindleBrake::Engage => ContainerType::MtEmcSpindleBrakeEngage,
            SpindleBrake::Release => ContainerType::MtEmcSpindleBrakeRelease,
        };
        self.send_command(kind, Container::default())
    }

    pub fn set_spindle(&self, mode: SpindleMode, velocity: f64) -> Option<u32> {
        let mut container = Container::default();
        let kind = match mode {
            SpindleMode::Forward => {
                container.emc_command_params = Some(EmcCommandParameters {
                    velocity: Some(velocity),
                    ..Default::default()
                });
                ContainerType::MtEmcSpindleOn
            }
            SpindleMode::Reverse => {
                container.emc_command_params = Some(EmcCommandParameters {
                    velocity: Some(-velocity),
                    ..Default::default()
                });
                ContainerType::MtEmcSpindleOn
            }
            SpindleMode::Off => ContainerType::MtEmcSpindleOff,
            SpindleMode::Increase => ContainerType::MtEmcSpindleIncrease,
            SpindleMode::Decrease => ContainerType::MtEmcSpindleDecrease,
            SpindleMode::Constant => ContainerType::MtEmcSpindleConstant,
        };
        self.send_command(kind, container)
    }

    pub fn set_feed_override(&self, scale: f64) -> Option<u32> {
        self.scale_command(ContainerType::MtEmcTrajSetScale, scale)
    }

    pub fn set_rapid_override(&self, scale: f64) -> Option<u32> {
        self.scale_command(ContainerType::MtEmcTrajSetRapidScale, scale)
    }

    pub fn set_spindle_override(&self, scale: f64) -> Option<u32> {
        self.scale_command(ContainerType::MtEmcTrajSetSpindleScale, scale)
    }

    pub fn set_maximum_velocity(&self, velocity: f64) -> Option<u32> {
        let mut container = Container::default();
        container.emc_command_params = Some(EmcCommandParameters {
            velocity: Some(velocity),
            ..Default::default()
        });
        self.send_command(ContainerType::MtEmcTrajSetMaxVelocity, container)
    }

    pub fn set_trajectory_mode(&self, mode: TrajectoryMode) -> Option<u32> {
        let mut container = Container::default();
        container.emc_command_params = Some(EmcCommandParameters {
            traj_mode: Some(mode as i32),
            ..Default::default()
        });
        self.send_command(ContainerType::MtEmcTrajSetMode, container)
    }

    pub fn set_flood_enabled(&self, enable: bool) -> Option<u32> {
        let kind = if enable {
            ContainerType::MtEmcCoolantFloodOn
        } else {
            ContainerType::MtEmcCoolantFloodOff
        };
        self.send_command(kind, Container::default())
    }

    pub fn set_mist_enabled(&self, enable: bool) -> Option<u32> {
        let kind = if enable {
            ContainerType::MtEmcCoolantMistOn
        } else {
            ContainerType::MtEmcCoolantMistOff
        };
        self.send_command(kind, Container::default())
    }

    pub fn home_axis(&self, index: u32) -> Option<u32> {
        self.axis_command(ContainerType::MtEmcAxisHome, index)
    }

    pub fn unhome_axis(&self, index: u32) -> Option<u32> {
        self.axis_command(ContainerType::MtEmcAxisUnhome, index)
    }

    pub fn override_limits(&self) -> Option<u32> {
        self.send_command(ContainerType::MtEmcAxisOverrideLimits, Container::default())
    }

    pub fn jog(&self, jog_type: JogType, axis: u32, velocity: f64, distance: f64) -> Option<u32> {
        let mut params = EmcCommandParameters {
            index: Some(axis),
            ..Default::default()
        };
        let kind = match jog_type {
            JogType::Stop => ContainerType::MtEmcAxisAbort,
            JogType::Continuous => {
                params.velocity = Some(velocity);
                ContainerType::MtEmcAxisJog
            }
            JogType::Increment => {
                params.velocity = Some(velocity);
                params.distance = Some(distance);
                ContainerType::MtEmcAxisIncrJog
            }
        };
        let mut container = Container::default();
        container.emc_command_params = Some(params);
        self.send_command(kind, container)
    }

    pub fn set_axis_max_position_limit(&self, axis: u32, value: f64) -> Option<u32> {
        self.axis_value_command(ContainerType::MtEmcAxisSetMaxPositionLimit, axis, value)
    }

    pub fn set_axis_min_position_limit(&self, axis: u32, value: f64) -> Option<u32> {
        self.axis_value_command(ContainerType::MtEmcAxisSetMinPositionLimit, axis, value)
    }

    pub fn load_tool_table(&self) -> Option<u32> {
        self.send_command(ContainerType::MtEmcToolLoadToolTable, Container::default())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_tool_offset(
        &self,
        index: i32,
        zoffset: f64,
        xoffset: f64,
        diameter: f64,
        frontangle: f64,
        backangle: f64,
        orientation: i32,
    ) -> Option<u32> {
        let mut container = Container::default();
        container.emc_command_params = Some(EmcCommandParameters {
            tool_data: Some(ToolData {
                index: Some(index),
                zoffset: Some(zoffset),
                xoffset: Some(xoffset),
                diameter: Some(diameter),
                frontangle: Some(frontangle),
                backangle: Some(backangle),
                orientation: Some(orientation),
                ..Default::default()
            }),
            ..Default::default()
        });
        self.send_command(ContainerType::MtEmcToolSetOffset, container)
    }

    pub fn set_adaptive_feed_enabled(&self, enable: bool) -> Option<u32> {
        self.enable_command(ContainerType::MtEmcMotionAdaptive, enable)
    }

    pub fn set_analog_output(&self, index: u32, value: f64) -> Option<u32> {
        let mut container = Container::default();
        container.emc_command_params = Some(EmcCommandParameters {
            index: Some(index),
            value: Some(value),
            ..Default::default()
        });
        self.send_command(ContainerType::MtEmcMotionSetAout, container)
    }

    pub fn set_digital_output(&self, index: u32, enable: bool) -> Option<u32> {
        let mut container = Container::default();
        container.emc_command_params = Some(EmcCommandParameters {
            index: Some(index),
            enable: Some(enable),
            ..Default::default()
        });
        self.send_command(ContainerType::MtEmcMotionSetDout, container)
    }

    pub fn set_block_delete_enabled(&self, enable: bool) -> Option<u32> {
        self.enable_command(ContainerType::MtEmcTaskPlanSetBlockDelete, enable)
    }

    pub fn set_optional_stop_enabled(&self, enable: bool) -> Option<u32> {
        self.enable_command(ContainerType::MtEmcTaskPlanSetOptionalStop, enable)
    }

    pub fn set_feed_hold_enabled(&self, enable: bool) -> Option<u32> {
        self.enable_command(ContainerType::MtEmcTrajSetFhEnable, enable)
    }

    pub fn set_feed_override_enabled(&self, enable: bool) -> Option<u32> {
        self.enable_command(ContainerType::MtEmcTrajSetFoEnable, enable)
    }

    pub fn set_spindle_override_enabled(&self, enable: bool) -> Option<u32> {
        self.enable_command(ContainerType::MtEmcTrajSetSoEnable, enable)
    }

    pub fn set_teleop_enabled(&self, enable: bool) -> Option<u32> {
        self.enable_command(ContainerType::MtEmcTrajSetTeleopEnable, enable)
    }

    #[allow(clippy::many_single_char_names)]
    pub fn set_teleop_vector(
        &self,
        a: f64,
        b: f64,
        c: f64,
        u: f64,
        v: f64,
        w: f64,
    ) -> Option<u32> {
        let mut container = Container::default();
        container.emc_command_params = Some(EmcCommandParameters {
            pose: Some(Position {
                a: Some(a),
                b: Some(b),
                c: Some(c),
                u: Some(u),
                v: Some(v),
                w: Some(w),
                ..Default::default()
            }),
            ..Default::default()
        });
        self.send_command(ContainerType::MtEmcTrajSetTeleopVector, container)
    }

    pub fn shutdown(&self) -> Option<u32> {
        self.send_command(ContainerType::MtShutdown, Container::default())
    }

    // ===== helpers =====

    /// Allocate a ticket and transmit; both happen under the transmit
    /// lock so tickets reflect transmit order.
    fn send_command(&self, msg_type: ContainerType, mut container: Container) -> Option<u32> {
        if !self.connected() {
            return None;
        }
        let mut ticket = self.shared.ticket.lock().expect("ticket poisoned");
        *ticket += 1;
        container.ticket = Some(*ticket);
        self.base.send_command(msg_type, container);
        Some(*ticket)
    }

    fn task_command(&self, msg_type: ContainerType, mut container: Container) -> Option<u32> {
        container.interp_name = Some(
            self.shared
                .interp_name
                .lock()
                .expect("interp name poisoned")
                .clone(),
        );
        self.send_command(msg_type, container)
    }

    fn enable_command(&self, msg_type: ContainerType, enable: bool) -> Option<u32> {
        let mut container = Container::default();
        container.emc_command_params = Some(EmcCommandParameters {
            enable: Some(enable),
            ..Default::default()
        });
        self.send_command(msg_type, container)
    }

    fn scale_command(&self, msg_type: ContainerType, scale: f64) -> Option<u32> {
        let mut container = Container::default();
        container.emc_command_params = Some(EmcCommandParameters {
            scale: Some(scale),
            ..Default::default()
        });
        self.send_command(msg_type, container)
    }

    fn axis_command(&self, msg_type: ContainerType, index: u32) -> Option<u32> {
        let mut container = Container::default();
        container.emc_command_params = Some(EmcCommandParameters {
            index: Some(index),
            ..Default::default()
        });
        self.send_command(msg_type, container)
    }

    fn axis_value_command(&self, msg_type: ContainerType, index: u32, value: f64) -> Option<u32> {
        let mut container = Container::default();
        container.emc_command_params = Some(EmcCommandParameters {
            index: Some(index),
            value: Some(value),
            ..Default::default()
        });
        self.send_command(msg_type, container)
    }
}

impl Drop for ApplicationCommand {
    fn drop(&mut self) {
        self.base.stop();
    }
}

impl CommandShared {
    fn update_connected(&self, connected: bool) {
        {
            let mut current = self.connected.lock().expect("connected poisoned");
            *current = connected;
            self.connected_condvar.notify_all();
        }
        self.connected_observers.notify(&connected);
    }

    fn reply_received(&self, reply: &Mutex<ReplyState>, condvar: &Condvar, ticket: u32) {
        let mut state = reply.lock().expect("reply state poisoned");
        state.ticket = ticket;
        state.sequence += 1;
        condvar.notify_all();
    }

    fn wait_reply(
        &self,
        reply: &Mutex<ReplyState>,
        condvar: &Condvar,
        ticket: Option<u32>,
        timeout: Option<Duration>,
    ) -> bool {
        let deadline = deadline_after(timeout);
        let mut state = reply.lock().expect("reply state poisoned");
        match ticket {
            Some(ticket) => loop {
                if state.ticket >= ticket {
                    return true;
                }
                let (guard, deadline_reached) = wait_until(condvar, state, deadline);
                state = guard;
                if deadline_reached {
                    return state.ticket >= ticket;
                }
            },
            None => {
                let sequence = state.sequence;
                loop {
                    if state.sequence != sequence {
                        return true;
                    }
                    let (guard, deadline_reached) = wait_until(condvar, state, deadline);
                    state = guard;
                    if deadline_reached {
                        return state.sequence != sequence;
                    }
                }
            }
        }
    }
}
