//! XR50 HID wire format: command framing and edge report decoding.

use crate::types::{host_clock_s, Capabilities, ImuSample, Orientation, Pose};
use crate::{CaptureError, Result};
use bitflags::bitflags;

pub const VID: u16 = 0x040E;
pub const PID: u16 = 0xF408;
pub const HID_INTERFACE: i32 = 3;

pub const REPORT_SIZE: usize = 63;

/// Fixed-point scale of every pose and IMU field: 2^-14.
pub const SCALE: f64 = 1.0 / 16384.0;

pub const PREFIX_HOST_TO_DEVICE: u8 = 0x02;
pub const PREFIX_DEVICE_TO_HOST: u8 = 0x01;

pub const CMD_UUID: &[u8] = &[0xFD, 0x66, 0x00, 0x02];
pub const CMD_VERSION: &[u8] = &[0x1C, 0x99];
pub const CMD_FEATURES: &[u8] = &[0xDE, 0x62, 0x01];
pub const CMD_CONFIGURE: &[u8] = &[0x19, 0x95];
pub const CMD_EDGE_STREAM: &[u8] = &[0xA2, 0x33];

/// First bytes of every edge report: device-to-host prefix plus the
/// edge-stream command echo.
pub const EDGE_HEADER: [u8; 3] = [PREFIX_DEVICE_TO_HOST, 0xA2, 0x33];

bitflags! {
    /// Feature bitmap reported by the firmware.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u32 {
        const EDGE_MODE    = 1 << 0;
        const MIXED_MODE   = 1 << 1;
        const STEREO       = 1 << 2;
        const RGB          = 1 << 3;
        const TOF          = 1 << 4;
        const IA           = 1 << 5;
        const SGBM         = 1 << 6;
        const EYE_TRACKING = 1 << 10;
        const FACE_ID      = 1 << 12;
    }
}

impl Features {
    /// Stream kinds the hardware advertises. Pose, orientation and IMU all
    /// come from edge reports, so they need edge SLAM.
    pub fn capabilities(self) -> Capabilities {
        let mut caps = Capabilities::empty();
        if self.contains(Features::EDGE_MODE) {
            caps |= Capabilities::SLAM | Capabilities::ORIENTATION | Capabilities::IMU;
        }
        if self.contains(Features::STEREO) {
            caps |= Capabilities::FISHEYE;
        }
        if self.contains(Features::RGB) {
            caps |= Capabilities::COLOR;
        }
        if self.contains(Features::TOF) {
            caps |= Capabilities::DEPTH;
        }
        if self.contains(Features::EYE_TRACKING) {
            caps |= Capabilities::EYE_TRACKING;
        }
        caps
    }
}

/// `[0x02, cmd..., 0x00...]`, always `REPORT_SIZE` bytes.
pub fn build_command(cmd: &[u8]) -> [u8; REPORT_SIZE] {
    let mut buf = [0u8; REPORT_SIZE];
    buf[0] = PREFIX_HOST_TO_DEVICE;
    let len = cmd.len().min(REPORT_SIZE - 1);
    buf[1..1 + len].copy_from_slice(&cmd[..len]);
    buf
}

/// Select edge or host SLAM; UVC mode is always 0.
pub fn build_configure_cmd(edge: bool, embedded_algo: bool) -> [u8; REPORT_SIZE] {
    build_command(&[
        CMD_CONFIGURE[0],
        CMD_CONFIGURE[1],
        u8::from(edge),
        0,
        u8::from(embedded_algo),
    ])
}

/// Start (with rotation enabled) or stop the edge report stream.
pub fn build_edge_stream_cmd(start: bool) -> [u8; REPORT_SIZE] {
    let flag = u8::from(start);
    build_command(&[CMD_EDGE_STREAM[0], CMD_EDGE_STREAM[1], flag, flag, 0])
}

/// Check the prefix and command echo of a response; returns the payload
/// offset.
pub fn validate_response(response: &[u8], expected_cmd: &[u8]) -> Result<usize> {
    match response.first() {
        Some(&PREFIX_DEVICE_TO_HOST) => {}
        other => return Err(CaptureError::InvalidResponse(other.copied().unwrap_or(0))),
    }
    let end = 1 + expected_cmd.len();
    if response.get(1..end) != Some(expected_cmd) {
        return Err(CaptureError::CommandMismatch);
    }
    Ok(end)
}

/// NUL-terminated string.
pub fn extract_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

pub fn parse_features(payload: &[u8]) -> Features {
    match payload.get(..4) {
        Some(&[a, b, c, d]) => Features::from_bits_truncate(u32::from_le_bytes([a, b, c, d])),
        _ => Features::empty(),
    }
}

/// One edge report, split into the streams it feeds.
#[derive(Debug, Clone, Copy)]
pub struct EdgeReport {
    pub pose: Pose,
    pub imu: ImuSample,
}

impl EdgeReport {
    pub fn orientation(&self) -> Orientation {
        Orientation {
            quaternion: self.pose.quaternion,
            edge_timestamp_us: self.pose.edge_timestamp_us,
            host_timestamp_s: self.pose.host_timestamp_s,
        }
    }
}

fn i16_at(data: &[u8], at: usize) -> f64 {
    f64::from(i16::from_le_bytes([data[at], data[at + 1]])) * SCALE
}

fn i32_at(data: &[u8], at: usize) -> f64 {
    f64::from(i32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])) * SCALE
}

/// Decode an edge report.
///
/// Layout after the 3-byte header: u32 timestamp (us) at 3, translation as
/// 3 x i32 at 7, quaternion w,x,y,z as 4 x i16 at 19, accelerometer at 37,
/// gyroscope at 43, confidence at 57. Everything but the timestamp is scaled
/// by [`SCALE`]. Returns `None` for anything that is not an edge report.
pub fn parse_edge_report(data: &[u8]) -> Option<EdgeReport> {
    if data.len() < REPORT_SIZE || data[..3] != EDGE_HEADER {
        return None;
    }

    let host_timestamp_s = host_clock_s();
    let edge_timestamp_us = u64::from(u32::from_le_bytes([data[3], data[4], data[5], data[6]]));

    let translation = [i32_at(data, 7), i32_at(data, 11), i32_at(data, 15)];
    let (qw, qx, qy, qz) = (
        i16_at(data, 19),
        i16_at(data, 21),
        i16_at(data, 23),
        i16_at(data, 25),
    );

    let pose = Pose {
        translation,
        quaternion: [qx, qy, qz, qw],
        edge_timestamp_us,
        host_timestamp_s,
        confidence: i16_at(data, 57).clamp(0.0, 1.0),
    };
    let imu = ImuSample {
        accelerometer: [i16_at(data, 37), i16_at(data, 39), i16_at(data, 41)],
        gyroscope: [i16_at(data, 43), i16_at(data, 45), i16_at(data, 47)],
        temperature_c: None,
        edge_timestamp_us,
        host_timestamp_s,
    };
    Some(EdgeReport { pose, imu })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Captured from a device resting on a desk.
    const SAMPLE: [u8; 63] = [
        0x01, 0xa2, 0x33, 0x6b, 0xd1, 0x25, 0x5f, 0x58, 0x01, 0x00, 0x00, 0x1e, 0x00, 0x00, 0x00,
        0xc3, 0x01, 0x00, 0x00, 0x62, 0xc0, 0x3a, 0x03, 0x2d, 0x06, 0x5a, 0xfd, 0x56, 0xc0, 0xf3,
        0x05, 0x72, 0x06, 0xa9, 0x05, 0x6c, 0x3f, 0xa0, 0x56, 0x7d, 0x00, 0xf3, 0xff, 0xf2, 0xff,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x09, 0x00, 0x07, 0x00, 0x2b, 0x41, 0x00,
        0x00, 0x00, 0x00,
    ];

    #[test]
    fn test_build_commands() {
        let buf = build_command(CMD_UUID);
        assert_eq!(buf[0], PREFIX_HOST_TO_DEVICE);
        assert_eq!(&buf[1..5], CMD_UUID);
        assert!(buf[5..].iter().all(|&b| b == 0));

        assert_eq!(&build_configure_cmd(true, false)[..6], &[0x02, 0x19, 0x95, 1, 0, 0]);
        assert_eq!(&build_edge_stream_cmd(true)[..6], &[0x02, 0xA2, 0x33, 1, 1, 0]);
        assert_eq!(&build_edge_stream_cmd(false)[..6], &[0x02, 0xA2, 0x33, 0, 0, 0]);
    }

    #[test]
    fn test_validate_response() {
        let mut resp = [0u8; REPORT_SIZE];
        resp[0] = PREFIX_DEVICE_TO_HOST;
        resp[1..5].copy_from_slice(CMD_UUID);
        resp[5..9].copy_from_slice(b"XR50");
        let offset = validate_response(&resp, CMD_UUID).unwrap();
        assert_eq!(offset, 5);
        assert_eq!(extract_string(&resp[offset..]), "XR50");

        assert!(matches!(
            validate_response(&resp, CMD_VERSION),
            Err(CaptureError::CommandMismatch)
        ));
        assert!(matches!(
            validate_response(&[0x07], CMD_UUID),
            Err(CaptureError::InvalidResponse(0x07))
        ));
        assert!(matches!(
            validate_response(&[0x01, 0xFD], CMD_UUID),
            Err(CaptureError::CommandMismatch)
        ));
    }

    #[test]
    fn test_features_to_capabilities() {
        let features = parse_features(&[0x0D, 0x04, 0x00, 0x00]);
        assert_eq!(
            features,
            Features::EDGE_MODE | Features::STEREO | Features::RGB | Features::EYE_TRACKING
        );
        let caps = features.capabilities();
        assert!(caps.contains(Capabilities::SLAM | Capabilities::IMU | Capabilities::COLOR));
        assert!(!caps.contains(Capabilities::DEPTH));
        assert_eq!(parse_features(&[1, 2]), Features::empty());
        assert!(Features::MIXED_MODE.capabilities().is_empty());
    }

    #[test]
    fn test_parse_edge_report() {
        let report = parse_edge_report(&SAMPLE).unwrap();
        let pose = report.pose;
        assert_eq!(pose.edge_timestamp_us, 1_596_313_963);
        assert!((pose.translation[0] - 0.0210).abs() < 0.001);
        assert!((pose.translation[1] - 0.0018).abs() < 0.001);
        assert!((pose.translation[2] - 0.0275).abs() < 0.001);
        assert!((pose.quaternion[3] - (-0.994)).abs() < 0.001);
        assert!((pose.quaternion[0] - 0.050).abs() < 0.001);
        assert!((0.0..=1.0).contains(&pose.confidence));

        assert_eq!(report.imu.edge_timestamp_us, pose.edge_timestamp_us);
        assert_eq!(report.orientation().quaternion, pose.quaternion);
    }

    #[test]
    fn test_rejects_non_edge_reports() {
        let mut other = SAMPLE;
        other[1] = 0x1C;
        assert!(parse_edge_report(&other).is_none());
        assert!(parse_edge_report(&SAMPLE[..40]).is_none());
    }
}
