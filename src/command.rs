//! Text commands understood by the microscope's CAM interface.
//!
//! Coordinates are zero-based everywhere in this crate; the instrument counts
//! wells and fields from one, so [`Command::CamAdd`] shifts them on output.

use std::fmt;

/// A single instrument command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Clear the CAM job list.
    DeleteList,
    /// Append a job for one field of one well to the CAM list.
    CamAdd {
        /// Job pattern to run
        pattern: String,
        /// Well column, zero-based
        well_x: u32,
        /// Well row, zero-based
        well_y: u32,
        /// Field column, zero-based
        field_x: u32,
        /// Field row, zero-based
        field_y: u32,
        /// Stage x offset
        dx: i32,
        /// Stage y offset
        dy: i32,
    },
    /// Set the detector gain of a job.
    Gain {
        /// Acquisition job name
        job: String,
        /// Detector (photomultiplier) number
        detector: u32,
        /// Gain value
        value: u32,
    },
    /// Run the CAM list.
    StartCamScan,
    /// Start the scan.
    StartScan,
    /// Stop the scan.
    StopScan,
}

impl Command {
    /// CAM job for a field, without stage offset.
    pub fn cam_add(pattern: &str, well_x: u32, well_y: u32, field_x: u32, field_y: u32) -> Self {
        Command::CamAdd {
            pattern: pattern.to_string(),
            well_x,
            well_y,
            field_x,
            field_y,
            dx: 0,
            dy: 0,
        }
    }

    /// Gain command for a detector of a job.
    pub fn gain(job: &str, detector: u32, value: u32) -> Self {
        Command::Gain {
            job: job.to_string(),
            detector,
            value,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::DeleteList => write!(f, "/cmd:deletelist"),
            Command::CamAdd {
                pattern,
                well_x,
                well_y,
                field_x,
                field_y,
                dx,
                dy,
            } => write!(
                f,
                "/cmd:add /tar:camlist /exp:{pattern} /ext:af /slide:0 /wellx:{} /welly:{} \
                 /fieldx:{} /fieldy:{} /dxpos:{dx} /dypos:{dy}",
                well_x + 1,
                well_y + 1,
                field_x + 1,
                field_y + 1,
            ),
            Command::Gain {
                job,
                detector,
                value,
            } => write!(
                f,
                "/cmd:adjust /tar:pmt /num:{detector} /exp:{job} /prop:gain /value:{value}"
            ),
            Command::StartCamScan => write!(f, "/cmd:startcamscan"),
            Command::StartScan => write!(f, "/cmd:startscan"),
            Command::StopScan => write!(f, "/cmd:stopscan"),
        }
    }
}
