use crate::CaptureError;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// One logical sensor feed a device can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamKind {
    Orientation,
    Fisheye,
    Color,
    Depth,
    Slam,
    Imu,
    EyeTracking,
}

impl StreamKind {
    pub const ALL: [StreamKind; 7] = [
        StreamKind::Orientation,
        StreamKind::Fisheye,
        StreamKind::Color,
        StreamKind::Depth,
        StreamKind::Slam,
        StreamKind::Imu,
        StreamKind::EyeTracking,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StreamKind::Orientation => "orientation",
            StreamKind::Fisheye => "fisheye",
            StreamKind::Color => "color",
            StreamKind::Depth => "depth",
            StreamKind::Slam => "slam",
            StreamKind::Imu => "imu",
            StreamKind::EyeTracking => "eyetracking",
        }
    }

    /// Capability bit a device must advertise to serve this stream.
    pub fn capability(self) -> Capabilities {
        match self {
            StreamKind::Orientation => Capabilities::ORIENTATION,
            StreamKind::Fisheye => Capabilities::FISHEYE,
            StreamKind::Color => Capabilities::COLOR,
            StreamKind::Depth => Capabilities::DEPTH,
            StreamKind::Slam => Capabilities::SLAM,
            StreamKind::Imu => Capabilities::IMU,
            StreamKind::EyeTracking => Capabilities::EYE_TRACKING,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StreamKind {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "orientation" | "3dof" => Ok(StreamKind::Orientation),
            "fisheye" | "stereo" => Ok(StreamKind::Fisheye),
            "color" | "rgb" => Ok(StreamKind::Color),
            "depth" | "tof" => Ok(StreamKind::Depth),
            "slam" | "6dof" | "pose" => Ok(StreamKind::Slam),
            "imu" => Ok(StreamKind::Imu),
            "eyetracking" | "eye_tracking" | "eye-tracking" => Ok(StreamKind::EyeTracking),
            other => Err(CaptureError::Config {
                key: "stream kind".into(),
                value: other.to_string(),
            }),
        }
    }
}

bitflags::bitflags! {
    /// Set of stream kinds a device supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const ORIENTATION  = 1 << 0;
        const FISHEYE      = 1 << 1;
        const COLOR        = 1 << 2;
        const DEPTH        = 1 << 3;
        const SLAM         = 1 << 4;
        const IMU          = 1 << 5;
        const EYE_TRACKING = 1 << 6;
    }
}

impl Capabilities {
    pub fn kinds(self) -> impl Iterator<Item = StreamKind> {
        StreamKind::ALL
            .into_iter()
            .filter(move |k| self.contains(k.capability()))
    }
}

/// Identifies one stream on one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle {
    pub device_id: String,
    pub kind: StreamKind,
}

impl StreamHandle {
    pub fn new(device_id: impl Into<String>, kind: StreamKind) -> Self {
        Self {
            device_id: device_id.into(),
            kind,
        }
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.kind)
    }
}

/// Seconds on the host steady clock, shared by every backend in the process.
pub fn host_clock_s() -> f64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// Pixel layout of an image buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Gray8,
    Yuyv,
    Yuv420p,
    Jpeg,
    /// Depth in millimetres, one `i16` per pixel.
    Depth16,
    /// Depth in metres, one `f32` per pixel.
    Depth32,
    Ir8,
}

impl ImageFormat {
    pub fn is_depth(self) -> bool {
        matches!(self, ImageFormat::Depth16 | ImageFormat::Depth32)
    }
}

/// Immutable image buffer. Cloning shares the pixel data.
#[derive(Debug, Clone)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub data: Arc<[u8]>,
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// 3DOF orientation sample.
#[derive(Debug, Clone, Copy)]
pub struct Orientation {
    /// Quaternion [qx, qy, qz, qw].
    pub quaternion: [f64; 4],
    pub edge_timestamp_us: u64,
    pub host_timestamp_s: f64,
}

/// Left/right fisheye pair from the stereo tracking cameras.
#[derive(Debug, Clone)]
pub struct FisheyeImages {
    pub images: Vec<Image>,
    pub edge_timestamp_us: u64,
    pub host_timestamp_s: f64,
}

#[derive(Debug, Clone)]
pub struct ColorImage {
    pub image: Image,
    pub edge_timestamp_us: u64,
    pub host_timestamp_s: f64,
}

#[derive(Debug, Clone)]
pub struct DepthImage {
    pub image: Image,
    pub edge_timestamp_us: u64,
    pub host_timestamp_s: f64,
}

#[derive(Debug, Clone)]
pub struct EyeTrackingImages {
    pub images: Vec<Image>,
    pub edge_timestamp_us: u64,
    pub host_timestamp_s: f64,
}

/// 6DOF pose from SLAM.
#[derive(Debug, Clone, Copy)]
pub struct Pose {
    /// Translation in meters [x, y, z].
    pub translation: [f64; 3],
    /// Quaternion [qx, qy, qz, qw].
    pub quaternion: [f64; 4],
    /// Edge timestamp in microseconds.
    pub edge_timestamp_us: u64,
    /// Host steady-clock timestamp in seconds.
    pub host_timestamp_s: f64,
    /// Tracking confidence [0..1].
    pub confidence: f64,
}

impl Pose {
    /// 3x3 row-major rotation matrix.
    pub fn rotation(&self) -> [[f64; 3]; 3] {
        let [x, y, z, w] = self.quaternion;
        [
            [1.0 - 2.0 * (y * y + z * z), 2.0 * (x * y - z * w), 2.0 * (x * z + y * w)],
            [2.0 * (x * y + z * w), 1.0 - 2.0 * (x * x + z * z), 2.0 * (y * z - x * w)],
            [2.0 * (x * z - y * w), 2.0 * (y * z + x * w), 1.0 - 2.0 * (x * x + y * y)],
        ]
    }

    /// [pitch, yaw, roll] in degrees: pitch about X, yaw about Y, roll about Z.
    pub fn pitch_yaw_roll_deg(&self) -> [f64; 3] {
        let [x, y, z, w] = self.quaternion;
        let pitch = (2.0 * (w * x - y * z)).clamp(-1.0, 1.0).asin();
        let yaw = (2.0 * (x * z + w * y)).atan2(1.0 - 2.0 * (x * x + y * y));
        let roll = (2.0 * (x * y + w * z)).atan2(1.0 - 2.0 * (x * x + z * z));
        [pitch.to_degrees(), yaw.to_degrees(), roll.to_degrees()]
    }

    /// Host-side delivery delay, in seconds, as of `now_s` on the host clock.
    pub fn delay_s(&self, now_s: f64) -> f64 {
        now_s - self.host_timestamp_s
    }
}

/// Raw inertial sample.
#[derive(Debug, Clone, Copy)]
pub struct ImuSample {
    /// Accelerometer [x, y, z] in g.
    pub accelerometer: [f64; 3],
    /// Gyroscope [x, y, z] in rad/s.
    pub gyroscope: [f64; 3],
    pub temperature_c: Option<f64>,
    pub edge_timestamp_us: u64,
    pub host_timestamp_s: f64,
}

/// A frame as delivered by the SDK, tagged by stream kind.
#[derive(Debug, Clone)]
pub enum Frame {
    Orientation(Orientation),
    Fisheye(FisheyeImages),
    Color(ColorImage),
    Depth(DepthImage),
    Slam(Pose),
    Imu(ImuSample),
    EyeTracking(EyeTrackingImages),
}

impl Frame {
    pub fn kind(&self) -> StreamKind {
        match self {
            Frame::Orientation(_) => StreamKind::Orientation,
            Frame::Fisheye(_) => StreamKind::Fisheye,
            Frame::Color(_) => StreamKind::Color,
            Frame::Depth(_) => StreamKind::Depth,
            Frame::Slam(_) => StreamKind::Slam,
            Frame::Imu(_) => StreamKind::Imu,
            Frame::EyeTracking(_) => StreamKind::EyeTracking,
        }
    }
}

/// Payload type carried by one stream kind.
///
/// Lets the controller and cache be written once over `P` instead of once per
/// stream kind.
pub trait FramePayload: fmt::Display + Send + Sync + Sized + 'static {
    const KIND: StreamKind;

    /// Unwrap the payload; `None` if the frame is of another kind or unusable.
    fn from_frame(frame: Frame) -> Option<Self>;
}

macro_rules! frame_payload {
    ($ty:ty, $variant:ident) => {
        impl FramePayload for $ty {
            const KIND: StreamKind = StreamKind::$variant;

            fn from_frame(frame: Frame) -> Option<Self> {
                match frame {
                    Frame::$variant(payload) => Some(payload),
                    _ => None,
                }
            }
        }

        impl From<$ty> for Frame {
            fn from(payload: $ty) -> Frame {
                Frame::$variant(payload)
            }
        }
    };
}

frame_payload!(Orientation, Orientation);
frame_payload!(FisheyeImages, Fisheye);
frame_payload!(ColorImage, Color);
frame_payload!(Pose, Slam);
frame_payload!(ImuSample, Imu);
frame_payload!(EyeTrackingImages, EyeTracking);

// Depth frames are only usable with a depth pixel format; IR-only frames from
// the ToF sensor are dropped.
impl FramePayload for DepthImage {
    const KIND: StreamKind = StreamKind::Depth;

    fn from_frame(frame: Frame) -> Option<Self> {
        match frame {
            Frame::Depth(depth) if depth.image.format.is_depth() => Some(depth),
            _ => None,
        }
    }
}

impl From<DepthImage> for Frame {
    fn from(payload: DepthImage) -> Frame {
        Frame::Depth(payload)
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let q = &self.quaternion;
        write!(f, "3dof=({:.4} {:.4} {:.4} {:.4})", q[0], q[1], q[2], q[3])
    }
}

impl fmt::Display for FisheyeImages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.images.first() {
            Some(image) => write!(f, "{} x{}", image, self.images.len()),
            None => f.write_str("(no images)"),
        }
    }
}

impl fmt::Display for ColorImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.image, self.image.format)
    }
}

impl fmt::Display for DepthImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.image, self.image.format)
    }
}

impl fmt::Display for EyeTrackingImages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.images.first() {
            Some(image) => write!(f, "{} x{}", image, self.images.len()),
            None => f.write_str("(no images)"),
        }
    }
}

impl fmt::Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let now = host_clock_s();
        let [x, y, z] = self.translation;
        let [pitch, yaw, roll] = self.pitch_yaw_roll_deg();
        write!(
            f,
            "(device={} host={:.4} now={:.4} delay={:.4}) ({:.4},{:.4},{:.4},{:.2},{:.2},{:.2}) conf={:.3}",
            self.edge_timestamp_us,
            self.host_timestamp_s,
            now,
            self.delay_s(now),
            x,
            y,
            z,
            pitch,
            yaw,
            roll,
            self.confidence
        )
    }
}

impl fmt::Display for ImuSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = &self.gyroscope;
        let a = &self.accelerometer;
        write!(
            f,
            "gyro=({:.4}, {:.4}, {:.4}) accel=({:.4}, {:.4}, {:.4})",
            g[0], g[1], g[2], a[0], a[1], a[2]
        )?;
        if let Some(t) = self.temperature_c {
            write!(f, " temp={:.1}", t)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pose_with_quaternion(quaternion: [f64; 4]) -> Pose {
        Pose {
            translation: [0.0; 3],
            quaternion,
            edge_timestamp_us: 0,
            host_timestamp_s: 0.0,
            confidence: 1.0,
        }
    }

    #[test]
    fn test_stream_kind_parse() {
        assert_eq!("RGB".parse::<StreamKind>().unwrap(), StreamKind::Color);
        assert_eq!(" tof ".parse::<StreamKind>().unwrap(), StreamKind::Depth);
        assert_eq!("eye-tracking".parse::<StreamKind>().unwrap(), StreamKind::EyeTracking);
        assert!("lidar".parse::<StreamKind>().is_err());
    }

    #[test]
    fn test_capability_kinds() {
        let caps = Capabilities::SLAM | Capabilities::IMU;
        let kinds: Vec<_> = caps.kinds().collect();
        assert_eq!(kinds, vec![StreamKind::Slam, StreamKind::Imu]);
    }

    #[test]
    fn test_identity_pose_angles() {
        let pose = pose_with_quaternion([0.0, 0.0, 0.0, 1.0]);
        for angle in pose.pitch_yaw_roll_deg() {
            assert!(angle.abs() < 1e-10);
        }
        let m = pose.rotation();
        assert!((m[0][0] - 1.0).abs() < 1e-10);
        assert!((m[1][1] - 1.0).abs() < 1e-10);
        assert!((m[2][2] - 1.0).abs() < 1e-10);
    }

    #[test]
    fn test_yaw_quarter_turn() {
        let half = std::f64::consts::FRAC_PI_4;
        let pose = pose_with_quaternion([0.0, half.sin(), 0.0, half.cos()]);
        let [pitch, yaw, roll] = pose.pitch_yaw_roll_deg();
        assert!(pitch.abs() < 1e-9);
        assert!((yaw - 90.0).abs() < 1e-9);
        assert!(roll.abs() < 1e-9);
    }

    #[test]
    fn test_depth_payload_rejects_ir() {
        let image = Image {
            width: 4,
            height: 2,
            format: ImageFormat::Ir8,
            data: Arc::from(vec![0u8; 8]),
        };
        let frame = Frame::Depth(DepthImage {
            image,
            edge_timestamp_us: 0,
            host_timestamp_s: 0.0,
        });
        assert!(DepthImage::from_frame(frame).is_none());
    }

    #[test]
    fn test_payload_kind_mismatch() {
        let frame: Frame = pose_with_quaternion([0.0, 0.0, 0.0, 1.0]).into();
        assert_eq!(frame.kind(), StreamKind::Slam);
        assert!(ImuSample::from_frame(frame.clone()).is_none());
        assert!(Pose::from_frame(frame).is_some());
    }
}
