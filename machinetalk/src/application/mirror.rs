//! Field-wise merging of incremental status updates into the typed
//! status mirror.

use machinetalk_proto::{
    ConfigAxis, EmcStatusConfig, EmcStatusInterp, EmcStatusIo, EmcStatusMotion, EmcStatusTask,
    MotionAxis, Position, ToolData,
};

/// Merge the fields present in `update` into `self`, leaving everything
/// else untouched.
///
/// Full updates replace a tree wholesale; incremental updates go through
/// this visitor: present optional fields overwrite, sub-messages recurse,
/// and repeated sub-messages address a dense array through their `index`
/// field, auto-extended on demand.
pub(crate) trait MergeUpdate {
    fn merge_update(&mut self, update: &Self);
}

/// Overwrite scalar fields that are present in the update.
macro_rules! merge_scalars {
    ($dst:expr, $src:expr, { $($field:ident),* $(,)? }) => {
        $(
            if $src.$field.is_some() {
                $dst.$field = $src.$field.clone();
            }
        )*
    };
}

/// Recurse into optional sub-messages that are present in the update.
macro_rules! merge_messages {
    ($dst:expr, $src:expr, { $($field:ident),* $(,)? }) => {
        $(
            if let Some(update) = &$src.$field {
                match &mut $dst.$field {
                    Some(current) => current.merge_update(update),
                    None => $dst.$field = Some(update.clone()),
                }
            }
        )*
    };
}

impl MergeUpdate for Position {
    fn merge_update(&mut self, update: &Self) {
        merge_scalars!(self, update, { x, y, z, a, b, c, u, v, w });
    }
}

impl MergeUpdate for MotionAxis {
    fn merge_update(&mut self, update: &Self) {
        merge_scalars!(self, update, {
            enabled,
            fault,
            ferror_current,
            homed,
            max_hard_limit,
            max_soft_limit,
            min_hard_limit,
            min_soft_limit,
            output,
            override_limits,
            velocity,
        });
    }
}

impl MergeUpdate for ConfigAxis {
    fn merge_update(&mut self, update: &Self) {
        merge_scalars!(self, update, {
            axis_type,
            backlash,
            max_position_limit,
            min_position_limit,
            units,
        });
    }
}

impl MergeUpdate for ToolData {
    fn merge_update(&mut self, update: &Self) {
        merge_scalars!(self, update, {
            index,
            id,
            zoffset,
            xoffset,
            diameter,
            frontangle,
            backangle,
            orientation,
            pocket,
        });
    }
}

impl MergeUpdate for EmcStatusMotion {
    fn merge_update(&mut self, update: &Self) {
        merge_scalars!(self, update, {
            active_queue,
            adaptive_feed_enabled,
            block_delete,
            current_line,
            current_vel,
            distance_to_go,
            enabled,
            feed_hold_enabled,
            feed_override_enabled,
            feedrate,
            id,
            in_position,
            motion_line,
            motion_mode,
            paused,
            rapidrate,
            spindle_brake,
            spindle_direction,
            spindle_enabled,
            spindle_override_enabled,
            spindle_speed,
            spindlerate,
            max_velocity,
            max_acceleration,
        });
        merge_messages!(self, update, {
            actual_position,
            dtg,
            g5x_offset,
            g92_offset,
            position,
            probed_position,
        });
        for axis in &update.axis {
            let index = axis.index as usize;
            while self.axis.len() <= index {
                self.axis.push(MotionAxis {
                    index: self.axis.len() as u32,
                    ..Default::default()
                });
            }
            self.axis[index].merge_update(axis);
        }
    }
}

impl MergeUpdate for EmcStatusConfig {
    fn merge_update(&mut self, update: &Self) {
        merge_scalars!(self, update, {
            acceleration,
            angular_units,
            axes,
            cycle_time,
            debug,
            kinematics_type,
            linear_units,
            max_acceleration,
            max_velocity,
            default_velocity,
            name,
        });
        for axis in &update.axis {
            let index = axis.index as usize;
            while self.axis.len() <= index {
                self.axis.push(ConfigAxis {
                    index: self.axis.len() as u32,
                    ..Default::default()
                });
            }
            self.axis[index].merge_update(axis);
        }
    }
}

impl MergeUpdate for EmcStatusIo {
    fn merge_update(&mut self, update: &Self) {
        merge_scalars!(self, update, {
            estop,
            flood,
            lube,
            lube_level,
            mist,
            pocket_prepped,
            tool_in_spindle,
        });
        merge_messages!(self, update, { tool_offset });
        for tool in &update.tool_table {
            let index = tool.index.unwrap_or_default().max(0) as usize;
            while self.tool_table.len() <= index {
                self.tool_table.push(ToolData {
                    index: Some(self.tool_table.len() as i32),
                    ..Default::default()
                });
            }
            self.tool_table[index].merge_update(tool);
        }
    }
}

impl MergeUpdate for EmcStatusTask {
    fn merge_update(&mut self, update: &Self) {
        merge_scalars!(self, update, {
            echo_serial_number,
            exec_state,
            file,
            input_timeout,
            optional_stop,
            read_line,
            task_mode,
            task_paused,
            task_state,
        });
    }
}

impl MergeUpdate for EmcStatusInterp {
    fn merge_update(&mut self, update: &Self) {
        merge_scalars!(self, update, {
            command,
            interp_state,
            interpreter_errcode,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_fields_overwrite_absent_fields_survive() {
        let mut mirror = EmcStatusTask {
            task_mode: Some(1),
            file: Some("part.ngc".to_owned()),
            ..Default::default()
        };
        let update = EmcStatusTask {
            task_mode: Some(2),
            ..Default::default()
        };
        mirror.merge_update(&update);
        assert_eq!(mirror.task_mode, Some(2));
        assert_eq!(mirror.file.as_deref(), Some("part.ngc"));
    }

    #[test]
    fn positions_merge_field_by_field() {
        let mut mirror = EmcStatusMotion {
            position: Some(Position {
                x: Some(1.0),
                y: Some(2.0),
                ..Default::default()
            }),
            ..Default::default()
        };
        let update = EmcStatusMotion {
            position: Some(Position {
                y: Some(5.0),
                ..Default::default()
            }),
            ..Default::default()
        };
        mirror.merge_update(&update);
        let position = mirror.position.unwrap();
        assert_eq!(position.x, Some(1.0));
        assert_eq!(position.y, Some(5.0));
    }

    #[test]
    fn indexed_axis_array_extends_on_demand() {
        let mut mirror = EmcStatusMotion::default();
        let update = EmcStatusMotion {
            axis: vec![MotionAxis {
                index: 2,
                homed: Some(true),
                ..Default::default()
            }],
            ..Default::default()
        };
        mirror.merge_update(&update);
        assert_eq!(mirror.axis.len(), 3);
        assert_eq!(mirror.axis[0].index, 0);
        assert_eq!(mirror.axis[2].homed, Some(true));

        // a later partial update touches only what it carries
        let update = EmcStatusMotion {
            axis: vec![MotionAxis {
                index: 2,
                velocity: Some(1.5),
                ..Default::default()
            }],
            ..Default::default()
        };
        mirror.merge_update(&update);
        assert_eq!(mirror.axis[2].homed, Some(true));
        assert_eq!(mirror.axis[2].velocity, Some(1.5));
    }
}
