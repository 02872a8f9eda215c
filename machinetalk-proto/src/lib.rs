//! Message definitions for the Machinetalk wire protocol.
//!
//! Every Machinetalk socket carries exactly one message shape: the
//! [`Container`] envelope. Its `type` field selects which of the optional
//! sub-messages is meaningful. The numeric tags and enum values in this
//! crate mirror the `machinetalk-protobuf` schema the servers speak; the
//! structs are maintained by hand in prost form so that no protoc run is
//! needed to build the client.

use std::ops::Index;

/// Message-kind discriminator carried in [`Container::type`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ContainerType {
    MtUnspecified = 0,

    MtPing = 10,
    MtPingAcknowledge = 11,
    MtError = 12,
    MtLogMessage = 13,
    MtShutdown = 14,

    MtEmcstatFullUpdate = 100,
    MtEmcstatIncrementalUpdate = 101,
    MtEmccmdExecuted = 110,
    MtEmccmdCompleted = 111,

    MtHalrcompFullUpdate = 120,
    MtHalrcompIncrementalUpdate = 121,
    MtHalrcompError = 122,
    MtHalrcompBind = 123,
    MtHalrcompBindConfirm = 124,
    MtHalrcompBindReject = 125,
    MtHalrcompSet = 126,
    MtHalrcompSetReject = 127,

    MtEmcNmlError = 130,
    MtEmcNmlText = 131,
    MtEmcNmlDisplay = 132,
    MtEmcOperatorError = 133,
    MtEmcOperatorText = 134,
    MtEmcOperatorDisplay = 135,

    MtEmcTaskAbort = 200,
    MtEmcTaskPlanRun = 201,
    MtEmcTaskPlanPause = 202,
    MtEmcTaskPlanStep = 203,
    MtEmcTaskPlanResume = 204,
    MtEmcTaskPlanInit = 205,
    MtEmcTaskPlanOpen = 206,
    MtEmcTaskPlanExecute = 207,
    MtEmcTaskPlanSetOptionalStop = 208,
    MtEmcTaskPlanSetBlockDelete = 209,
    MtEmcTaskSetMode = 210,
    MtEmcTaskSetState = 211,
    MtEmcSetDebug = 212,

    MtEmcCoolantFloodOn = 220,
    MtEmcCoolantFloodOff = 221,
    MtEmcCoolantMistOn = 222,
    MtEmcCoolantMistOff = 223,

    MtEmcAxisHome = 230,
    MtEmcAxisUnhome = 231,
    MtEmcAxisJog = 232,
    MtEmcAxisIncrJog = 233,
    MtEmcAxisAbort = 234,
    MtEmcAxisSetMaxPositionLimit = 235,
    MtEmcAxisSetMinPositionLimit = 236,
    MtEmcAxisOverrideLimits = 237,

    MtEmcTrajSetScale = 240,
    MtEmcTrajSetRapidScale = 241,
    MtEmcTrajSetSpindleScale = 242,
    MtEmcTrajSetMaxVelocity = 243,
    MtEmcTrajSetMode = 244,
    MtEmcTrajSetSoEnable = 245,
    MtEmcTrajSetFhEnable = 246,
    MtEmcTrajSetFoEnable = 247,
    MtEmcTrajSetTeleopEnable = 248,
    MtEmcTrajSetTeleopVector = 249,

    MtEmcSpindleOn = 260,
    MtEmcSpindleOff = 261,
    MtEmcSpindleIncrease = 262,
    MtEmcSpindleDecrease = 263,
    MtEmcSpindleConstant = 264,
    MtEmcSpindleBrakeEngage = 265,
    MtEmcSpindleBrakeRelease = 266,

    MtEmcMotionSetAout = 270,
    MtEmcMotionSetDout = 271,
    MtEmcMotionAdaptive = 272,

    MtEmcToolLoadToolTable = 280,
    MtEmcToolUpdateToolTable = 281,
    MtEmcToolSetOffset = 282,
}

/// HAL pin value types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum ValueType {
    HalBit = 1,
    HalFloat = 2,
    HalS32 = 3,
    HalU32 = 4,
}

/// HAL pin directions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum PinDirection {
    HalIn = 16,
    HalOut = 32,
    HalIo = 48,
}

/// RTAPI log levels, ordered from quiet to verbose.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MsgLevel {
    MsgNone = 0,
    MsgErr = 1,
    MsgWarn = 2,
    MsgInfo = 3,
    MsgDbg = 4,
    MsgAll = 5,
}

/// Origin of a log record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum MsgOrigin {
    MsgKernel = 0,
    MsgRtuser = 1,
    MsgUlapi = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum TaskMode {
    EmcTaskModeManual = 1,
    EmcTaskModeAuto = 2,
    EmcTaskModeMdi = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum TaskState {
    EmcTaskStateEstop = 1,
    EmcTaskStateEstopReset = 2,
    EmcTaskStateOff = 3,
    EmcTaskStateOn = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum InterpreterState {
    EmcTaskInterpIdle = 1,
    EmcTaskInterpReading = 2,
    EmcTaskInterpPaused = 3,
    EmcTaskInterpWaiting = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum TrajectoryMode {
    EmcTrajModeFree = 1,
    EmcTrajModeCoord = 2,
    EmcTrajModeTeleop = 3,
}

/// The single envelope exchanged on every Machinetalk socket.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Container {
    #[prost(enumeration = "ContainerType", tag = "1")]
    pub r#type: i32,
    /// Human-readable notes, filled on error and reject replies.
    #[prost(string, repeated, tag = "2")]
    pub note: Vec<String>,
    /// Client-assigned command identifier.
    #[prost(uint32, optional, tag = "3")]
    pub ticket: Option<u32>,
    /// Server echo of the ticket a reply refers to.
    #[prost(uint32, optional, tag = "4")]
    pub reply_ticket: Option<u32>,
    #[prost(message, optional, tag = "5")]
    pub pparams: Option<ProtocolParameters>,
    #[prost(int64, optional, tag = "6")]
    pub tv_sec: Option<i64>,
    #[prost(int32, optional, tag = "7")]
    pub tv_nsec: Option<i32>,
    /// Interpreter addressed by a task command.
    #[prost(string, optional, tag = "8")]
    pub interp_name: Option<String>,
    #[prost(message, optional, tag = "9")]
    pub emc_command_params: Option<EmcCommandParameters>,
    #[prost(message, optional, tag = "10")]
    pub log_message: Option<LogMessage>,
    #[prost(message, optional, tag = "11")]
    pub emc_status_motion: Option<EmcStatusMotion>,
    #[prost(message, optional, tag = "12")]
    pub emc_status_config: Option<EmcStatusConfig>,
    #[prost(message, optional, tag = "13")]
    pub emc_status_io: Option<EmcStatusIo>,
    #[prost(message, optional, tag = "14")]
    pub emc_status_task: Option<EmcStatusTask>,
    #[prost(message, optional, tag = "15")]
    pub emc_status_interp: Option<EmcStatusInterp>,
    #[prost(message, repeated, tag = "16")]
    pub pin: Vec<Pin>,
    #[prost(message, repeated, tag = "17")]
    pub comp: Vec<Component>,
}

impl Container {
    /// Shorthand for an otherwise empty container of the given kind.
    pub fn with_type(r#type: ContainerType) -> Self {
        Container {
            r#type: r#type as i32,
            ..Default::default()
        }
    }

    /// The discriminator as an enum, if the numeric value is known.
    pub fn container_type(&self) -> Option<ContainerType> {
        ContainerType::try_from(self.r#type).ok()
    }
}

/// Keep-alive parameters advertised by the server on full updates.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ProtocolParameters {
    /// Heartbeat interval in milliseconds.
    #[prost(uint32, optional, tag = "1")]
    pub keepalive_timer: Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogMessage {
    #[prost(enumeration = "MsgLevel", tag = "1")]
    pub level: i32,
    #[prost(enumeration = "MsgOrigin", tag = "2")]
    pub origin: i32,
    #[prost(uint32, optional, tag = "3")]
    pub pid: Option<u32>,
    #[prost(string, optional, tag = "4")]
    pub tag: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub text: Option<String>,
}

/// A HAL pin as it appears on the wire, both in bind payloads and in
/// full and incremental remote component updates.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pin {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    /// Server-assigned identifier, present from the first full update on.
    #[prost(uint32, optional, tag = "2")]
    pub handle: Option<u32>,
    #[prost(enumeration = "ValueType", optional, tag = "3")]
    pub r#type: Option<i32>,
    #[prost(enumeration = "PinDirection", optional, tag = "4")]
    pub dir: Option<i32>,
    #[prost(bool, optional, tag = "5")]
    pub halbit: Option<bool>,
    #[prost(double, optional, tag = "6")]
    pub halfloat: Option<f64>,
    #[prost(int32, optional, tag = "7")]
    pub hals32: Option<i32>,
    #[prost(uint32, optional, tag = "8")]
    pub halu32: Option<u32>,
}

/// A remote HAL component descriptor used in bind payloads and full
/// updates.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Component {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(bool, optional, tag = "2")]
    pub no_create: Option<bool>,
    #[prost(message, repeated, tag = "3")]
    pub pin: Vec<Pin>,
}

/// Parameters of machine commands; which fields are meaningful depends on
/// the container type.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EmcCommandParameters {
    #[prost(uint32, optional, tag = "1")]
    pub index: Option<u32>,
    #[prost(int32, optional, tag = "2")]
    pub line_number: Option<i32>,
    #[prost(enumeration = "TaskMode", optional, tag = "3")]
    pub task_mode: Option<i32>,
    #[prost(enumeration = "TaskState", optional, tag = "4")]
    pub task_state: Option<i32>,
    #[prost(enumeration = "TrajectoryMode", optional, tag = "5")]
    pub traj_mode: Option<i32>,
    #[prost(double, optional, tag = "6")]
    pub velocity: Option<f64>,
    #[prost(double, optional, tag = "7")]
    pub distance: Option<f64>,
    #[prost(double, optional, tag = "8")]
    pub scale: Option<f64>,
    #[prost(bool, optional, tag = "9")]
    pub enable: Option<bool>,
    #[prost(string, optional, tag = "10")]
    pub command: Option<String>,
    #[prost(string, optional, tag = "11")]
    pub path: Option<String>,
    #[prost(uint32, optional, tag = "12")]
    pub debug_level: Option<u32>,
    #[prost(double, optional, tag = "13")]
    pub value: Option<f64>,
    #[prost(message, optional, tag = "14")]
    pub pose: Option<Position>,
    #[prost(message, optional, tag = "15")]
    pub tool_data: Option<ToolData>,
}

/// A nine-axis pose. Positions 0..=8 map to `x y z a b c u v w`.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Position {
    #[prost(double, optional, tag = "1")]
    pub x: Option<f64>,
    #[prost(double, optional, tag = "2")]
    pub y: Option<f64>,
    #[prost(double, optional, tag = "3")]
    pub z: Option<f64>,
    #[prost(double, optional, tag = "4")]
    pub a: Option<f64>,
    #[prost(double, optional, tag = "5")]
    pub b: Option<f64>,
    #[prost(double, optional, tag = "6")]
    pub c: Option<f64>,
    #[prost(double, optional, tag = "7")]
    pub u: Option<f64>,
    #[prost(double, optional, tag = "8")]
    pub v: Option<f64>,
    #[prost(double, optional, tag = "9")]
    pub w: Option<f64>,
}

impl Position {
    const AXES: usize = 9;

    /// The value at `axis`, counting `x` as 0 and `w` as 8.
    pub fn axis(&self, axis: usize) -> Option<f64> {
        match axis {
            0 => self.x,
            1 => self.y,
            2 => self.z,
            3 => self.a,
            4 => self.b,
            5 => self.c,
            6 => self.u,
            7 => self.v,
            8 => self.w,
            _ => None,
        }
    }
}

impl Index<usize> for Position {
    type Output = f64;

    fn index(&self, axis: usize) -> &f64 {
        const ZERO: f64 = 0.0;
        if axis >= Self::AXES {
            panic!("position axis out of range: {axis}");
        }
        match axis {
            0 => self.x.as_ref(),
            1 => self.y.as_ref(),
            2 => self.z.as_ref(),
            3 => self.a.as_ref(),
            4 => self.b.as_ref(),
            5 => self.c.as_ref(),
            6 => self.u.as_ref(),
            7 => self.v.as_ref(),
            _ => self.w.as_ref(),
        }
        .unwrap_or(&ZERO)
    }
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ToolData {
    #[prost(int32, optional, tag = "1")]
    pub index: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub id: Option<i32>,
    #[prost(double, optional, tag = "3")]
    pub zoffset: Option<f64>,
    #[prost(double, optional, tag = "4")]
    pub xoffset: Option<f64>,
    #[prost(double, optional, tag = "5")]
    pub diameter: Option<f64>,
    #[prost(double, optional, tag = "6")]
    pub frontangle: Option<f64>,
    #[prost(double, optional, tag = "7")]
    pub backangle: Option<f64>,
    #[prost(int32, optional, tag = "8")]
    pub orientation: Option<i32>,
    #[prost(int32, optional, tag = "9")]
    pub pocket: Option<i32>,
}

/// Snapshot of the motion controller, published on the `motion` topic.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EmcStatusMotion {
    #[prost(int32, optional, tag = "1")]
    pub active_queue: Option<i32>,
    #[prost(message, optional, tag = "2")]
    pub actual_position: Option<Position>,
    #[prost(bool, optional, tag = "3")]
    pub adaptive_feed_enabled: Option<bool>,
    #[prost(bool, optional, tag = "4")]
    pub block_delete: Option<bool>,
    #[prost(int32, optional, tag = "5")]
    pub current_line: Option<i32>,
    #[prost(double, optional, tag = "6")]
    pub current_vel: Option<f64>,
    #[prost(double, optional, tag = "7")]
    pub distance_to_go: Option<f64>,
    #[prost(message, optional, tag = "8")]
    pub dtg: Option<Position>,
    #[prost(bool, optional, tag = "9")]
    pub enabled: Option<bool>,
    #[prost(bool, optional, tag = "10")]
    pub feed_hold_enabled: Option<bool>,
    #[prost(bool, optional, tag = "11")]
    pub feed_override_enabled: Option<bool>,
    #[prost(double, optional, tag = "12")]
    pub feedrate: Option<f64>,
    #[prost(message, optional, tag = "13")]
    pub g5x_offset: Option<Position>,
    #[prost(message, optional, tag = "14")]
    pub g92_offset: Option<Position>,
    #[prost(message, repeated, tag = "15")]
    pub axis: Vec<MotionAxis>,
    #[prost(int32, optional, tag = "16")]
    pub id: Option<i32>,
    #[prost(bool, optional, tag = "17")]
    pub in_position: Option<bool>,
    #[prost(int32, optional, tag = "18")]
    pub motion_line: Option<i32>,
    #[prost(enumeration = "TrajectoryMode", optional, tag = "19")]
    pub motion_mode: Option<i32>,
    #[prost(bool, optional, tag = "20")]
    pub paused: Option<bool>,
    #[prost(message, optional, tag = "21")]
    pub position: Option<Position>,
    #[prost(message, optional, tag = "22")]
    pub probed_position: Option<Position>,
    #[prost(double, optional, tag = "23")]
    pub rapidrate: Option<f64>,
    #[prost(bool, optional, tag = "24")]
    pub spindle_brake: Option<bool>,
    #[prost(int32, optional, tag = "25")]
    pub spindle_direction: Option<i32>,
    #[prost(bool, optional, tag = "26")]
    pub spindle_enabled: Option<bool>,
    #[prost(bool, optional, tag = "27")]
    pub spindle_override_enabled: Option<bool>,
    #[prost(double, optional, tag = "28")]
    pub spindle_speed: Option<f64>,
    #[prost(double, optional, tag = "29")]
    pub spindlerate: Option<f64>,
    #[prost(double, optional, tag = "30")]
    pub max_velocity: Option<f64>,
    #[prost(double, optional, tag = "31")]
    pub max_acceleration: Option<f64>,
}

/// Per-axis motion state, addressed by `index` in incremental updates.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MotionAxis {
    #[prost(uint32, tag = "1")]
    pub index: u32,
    #[prost(bool, optional, tag = "2")]
    pub enabled: Option<bool>,
    #[prost(bool, optional, tag = "3")]
    pub fault: Option<bool>,
    #[prost(double, optional, tag = "4")]
    pub ferror_current: Option<f64>,
    #[prost(bool, optional, tag = "5")]
    pub homed: Option<bool>,
    #[prost(bool, optional, tag = "6")]
    pub max_hard_limit: Option<bool>,
    #[prost(bool, optional, tag = "7")]
    pub max_soft_limit: Option<bool>,
    #[prost(bool, optional, tag = "8")]
    pub min_hard_limit: Option<bool>,
    #[prost(bool, optional, tag = "9")]
    pub min_soft_limit: Option<bool>,
    #[prost(double, optional, tag = "10")]
    pub output: Option<f64>,
    #[prost(bool, optional, tag = "11")]
    pub override_limits: Option<bool>,
    #[prost(double, optional, tag = "12")]
    pub velocity: Option<f64>,
}

/// Snapshot of the machine configuration, published on the `config` topic.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EmcStatusConfig {
    #[prost(double, optional, tag = "1")]
    pub acceleration: Option<f64>,
    #[prost(double, optional, tag = "2")]
    pub angular_units: Option<f64>,
    #[prost(int32, optional, tag = "3")]
    pub axes: Option<i32>,
    #[prost(message, repeated, tag = "4")]
    pub axis: Vec<ConfigAxis>,
    #[prost(double, optional, tag = "5")]
    pub cycle_time: Option<f64>,
    #[prost(int32, optional, tag = "6")]
    pub debug: Option<i32>,
    #[prost(int32, optional, tag = "7")]
    pub kinematics_type: Option<i32>,
    #[prost(double, optional, tag = "8")]
    pub linear_units: Option<f64>,
    #[prost(double, optional, tag = "9")]
    pub max_acceleration: Option<f64>,
    #[prost(double, optional, tag = "10")]
    pub max_velocity: Option<f64>,
    #[prost(double, optional, tag = "11")]
    pub default_velocity: Option<f64>,
    #[prost(string, optional, tag = "12")]
    pub name: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigAxis {
    #[prost(uint32, tag = "1")]
    pub index: u32,
    #[prost(int32, optional, tag = "2")]
    pub axis_type: Option<i32>,
    #[prost(double, optional, tag = "3")]
    pub backlash: Option<f64>,
    #[prost(double, optional, tag = "4")]
    pub max_position_limit: Option<f64>,
    #[prost(double, optional, tag = "5")]
    pub min_position_limit: Option<f64>,
    #[prost(double, optional, tag = "6")]
    pub units: Option<f64>,
}

/// Snapshot of machine I/O, published on the `io` topic.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EmcStatusIo {
    #[prost(bool, optional, tag = "1")]
    pub estop: Option<bool>,
    #[prost(bool, optional, tag = "2")]
    pub flood: Option<bool>,
    #[prost(bool, optional, tag = "3")]
    pub lube: Option<bool>,
    #[prost(int32, optional, tag = "4")]
    pub lube_level: Option<i32>,
    #[prost(bool, optional, tag = "5")]
    pub mist: Option<bool>,
    #[prost(int32, optional, tag = "6")]
    pub pocket_prepped: Option<i32>,
    #[prost(int32, optional, tag = "7")]
    pub tool_in_spindle: Option<i32>,
    #[prost(message, optional, tag = "8")]
    pub tool_offset: Option<Position>,
    #[prost(message, repeated, tag = "9")]
    pub tool_table: Vec<ToolData>,
}

/// Snapshot of the task controller, published on the `task` topic.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EmcStatusTask {
    #[prost(int32, optional, tag = "1")]
    pub echo_serial_number: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub exec_state: Option<i32>,
    #[prost(string, optional, tag = "3")]
    pub file: Option<String>,
    #[prost(bool, optional, tag = "4")]
    pub input_timeout: Option<bool>,
    #[prost(bool, optional, tag = "5")]
    pub optional_stop: Option<bool>,
    #[prost(int32, optional, tag = "6")]
    pub read_line: Option<i32>,
    #[prost(enumeration = "TaskMode", optional, tag = "7")]
    pub task_mode: Option<i32>,
    #[prost(bool, optional, tag = "8")]
    pub task_paused: Option<bool>,
    #[prost(enumeration = "TaskState", optional, tag = "9")]
    pub task_state: Option<i32>,
}

/// Snapshot of the interpreter, published on the `interp` topic.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EmcStatusInterp {
    #[prost(string, optional, tag = "1")]
    pub command: Option<String>,
    #[prost(enumeration = "InterpreterState", optional, tag = "2")]
    pub interp_state: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub interpreter_errcode: Option<i32>,
}
