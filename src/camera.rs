// Camera capability
//
// Capture backends live outside this crate; robots only need connect,
// disconnect and a bounded-latency read of the latest frame.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;

use crate::error::{Error, Result};

/// Row-major RGB8 frame
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Image {
    pub const CHANNELS: u32 = 3;

    pub fn shape(&self) -> (u32, u32, u32) {
        (self.height, self.width, Self::CHANNELS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
}

fn default_fps() -> u32 {
    30
}

pub trait Camera: Send {
    fn connect(&mut self) -> Result<()>;

    fn disconnect(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Latest frame, waiting at most `timeout` for one to arrive
    fn async_read(&mut self, timeout: Duration) -> Result<Image>;
}

/// Camera producing a moving gradient test pattern
#[derive(Debug)]
pub struct SyntheticCamera {
    name: String,
    config: CameraConfig,
    connected: bool,
    counter: u64,
}

impl SyntheticCamera {
    pub fn new(name: impl Into<String>, config: CameraConfig) -> Self {
        Self {
            name: name.into(),
            config,
            connected: false,
            counter: 0,
        }
    }

    pub fn frames_read(&self) -> u64 {
        self.counter
    }
}

impl Camera for SyntheticCamera {
    fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Err(Error::AlreadyConnected(format!("camera {}", self.name)));
        }
        self.connected = true;
        info!(
            "Camera {} connected ({}x{} @ {}fps)",
            self.name, self.config.width, self.config.height, self.config.fps
        );
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected(format!("camera {}", self.name)));
        }
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn async_read(&mut self, _timeout: Duration) -> Result<Image> {
        if !self.connected {
            return Err(Error::NotConnected(format!("camera {}", self.name)));
        }
        self.counter += 1;
        let (width, height) = (self.config.width, self.config.height);
        let mut data = Vec::with_capacity((width * height * Image::CHANNELS) as usize);
        for y in 0..height {
            for x in 0..width {
                let v = ((x + y + self.counter as u32) % 256) as u8;
                data.extend_from_slice(&[v, v, v]);
            }
        }
        Ok(Image {
            width,
            height,
            data,
        })
    }
}

/// Named cameras, iterated in name order
pub type CameraSet = BTreeMap<String, Box<dyn Camera>>;

/// Build synthetic cameras for every configured name
pub fn make_cameras_from_configs(configs: &BTreeMap<String, CameraConfig>) -> CameraSet {
    configs
        .iter()
        .map(|(name, &config)| {
            let camera: Box<dyn Camera> = Box::new(SyntheticCamera::new(name.clone(), config));
            (name.clone(), camera)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_frame_shape() {
        let mut cam = SyntheticCamera::new(
            "top",
            CameraConfig {
                width: 8,
                height: 4,
                fps: 30,
            },
        );
        assert!(cam.async_read(Duration::from_millis(10)).is_err());
        cam.connect().unwrap();
        let frame = cam.async_read(Duration::from_millis(10)).unwrap();
        assert_eq!(frame.shape(), (4, 8, 3));
        assert_eq!(frame.data.len(), 4 * 8 * 3);
        assert_eq!(cam.frames_read(), 1);
    }
}
