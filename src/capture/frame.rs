use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::driver::{Feature, FeatureValue, FrameContents, FrameStatus};
use crate::error::{Error, Result};

/// One delivered image, borrowed from the driver's frame buffer.
///
/// The buffer is handed back to the driver as soon as the frame callback
/// returns, so the lifetime ties the data to the callback. Copy it out
/// (see [`Pixels::from_frame`]) to keep it.
pub struct Frame<'a> {
    device: &'a Arc<Device>,
    contents: &'a FrameContents,
    frame_count: u64,
}

impl<'a> Frame<'a> {
    pub fn load(device: &'a Arc<Device>, contents: &'a FrameContents) -> Result<Self> {
        if contents.status != FrameStatus::Complete {
            return Err(Error::InvalidFrame("incomplete frame"));
        }
        if contents.pixel_format.is_empty() {
            return Err(Error::InvalidFrame("missing pixel format"));
        }
        if contents.width == 0 || contents.height == 0 {
            return Err(Error::InvalidFrame("missing dimensions"));
        }
        if contents.image_size as usize > contents.data.len() {
            return Err(Error::InvalidFrame("image larger than buffer"));
        }

        let mut frame = Self {
            device,
            contents,
            frame_count: contents.frame_id,
        };
        if let Some(count) = frame.ancillary::<u64>("ChunkAcquisitionFrameCount") {
            frame.frame_count = count;
        }
        Ok(frame)
    }

    pub fn device(&self) -> &Arc<Device> {
        self.device
    }

    pub fn id(&self) -> u64 {
        self.contents.frame_id
    }

    /// Camera clock timestamp.
    pub fn timestamp(&self) -> u64 {
        self.contents.timestamp
    }

    /// Acquisition counter from chunk data, or the frame id without it.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn width(&self) -> u32 {
        self.contents.width
    }

    pub fn height(&self) -> u32 {
        self.contents.height
    }

    pub fn image_size(&self) -> u32 {
        self.contents.image_size
    }

    /// Driver pixel format name, e.g. `Mono8`.
    pub fn image_format(&self) -> &str {
        &self.contents.pixel_format
    }

    pub fn data(&self) -> &'a [u8] {
        &self.contents.data[..self.contents.image_size as usize]
    }

    pub fn ancillary<T: Feature>(&self, name: &str) -> Option<T> {
        let value: &FeatureValue = self.contents.ancillary.as_ref()?.get(name)?;
        T::from_value(value.clone())
    }
}

/// Pixel formats we hand to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Gray8,
    Rgb24,
    Bgr24,
    Rgba32,
    Bgra32,
    Yuyv4,
}

impl PixelFormat {
    pub fn from_driver_name(name: &str) -> Option<Self> {
        match name {
            "Mono8" => Some(PixelFormat::Gray8),
            "RGB8Packed" => Some(PixelFormat::Rgb24),
            "BGR8Packed" => Some(PixelFormat::Bgr24),
            "RGBA8Packed" => Some(PixelFormat::Rgba32),
            "BGRA8Packed" => Some(PixelFormat::Bgra32),
            "YUV422Packed" => Some(PixelFormat::Yuyv4),
            _ => None,
        }
    }

    pub fn driver_name(self) -> &'static str {
        match self {
            PixelFormat::Gray8 => "Mono8",
            PixelFormat::Rgb24 => "RGB8Packed",
            PixelFormat::Bgr24 => "BGR8Packed",
            PixelFormat::Rgba32 => "RGBA8Packed",
            PixelFormat::Bgra32 => "BGRA8Packed",
            PixelFormat::Yuyv4 => "YUV422Packed",
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Yuyv4 => 2,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Rgba32 | PixelFormat::Bgra32 => 4,
        }
    }
}

/// Owned copy of a frame, safe to keep after the callback.
#[derive(Debug, Clone)]
pub struct Pixels {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub frame_id: u64,
    pub frame_count: u64,
    pub device_timestamp: u64,
    /// Arrival time on the delivery thread
    pub received_at: Instant,
}

impl Pixels {
    /// `None` when the frame's format has no host equivalent.
    pub fn from_frame(frame: &Frame<'_>) -> Option<Self> {
        let format = PixelFormat::from_driver_name(frame.image_format())?;
        Some(Self {
            data: Bytes::copy_from_slice(frame.data()),
            width: frame.width(),
            height: frame.height(),
            format,
            frame_id: frame.id(),
            frame_count: frame.frame_count(),
            device_timestamp: frame.timestamp(),
            received_at: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::driver::sim::{SimCameraConfig, SimDriver};
    use crate::driver::Driver;
    use crate::system::System;

    fn device() -> (Arc<SimDriver>, Arc<Device>) {
        let driver = SimDriver::new();
        let system = System::instance(&(driver.clone() as Arc<dyn Driver>));
        let camera = driver.plug(SimCameraConfig::with_id("DEV_000F31000F01"));
        (driver, Arc::new(Device::new(system, camera)))
    }

    fn contents() -> FrameContents {
        FrameContents {
            status: FrameStatus::Complete,
            frame_id: 7,
            timestamp: 1234,
            width: 2,
            height: 2,
            pixel_format: "RGB8Packed".into(),
            image_size: 12,
            data: (0..16).collect(),
            ancillary: None,
        }
    }

    #[test]
    fn frame_exposes_only_the_image() {
        let (_driver, device) = device();
        let contents = contents();
        let frame = Frame::load(&device, &contents).unwrap();
        assert_eq!(frame.data().len(), 12);
        assert_eq!(frame.frame_count(), 7);
        assert_eq!(frame.image_format(), "RGB8Packed");

        let pixels = Pixels::from_frame(&frame).unwrap();
        assert_eq!(pixels.format, PixelFormat::Rgb24);
        assert_eq!(&pixels.data[..], &(0..12).collect::<Vec<u8>>()[..]);
    }

    #[test]
    fn chunk_frame_count_wins() {
        let (_driver, device) = device();
        let mut contents = contents();
        contents.ancillary = Some(HashMap::from([(
            "ChunkAcquisitionFrameCount".to_string(),
            FeatureValue::Int(99),
        )]));
        let frame = Frame::load(&device, &contents).unwrap();
        assert_eq!(frame.frame_count(), 99);
        assert_eq!(frame.ancillary::<i64>("ChunkAcquisitionFrameCount"), Some(99));
        assert_eq!(frame.ancillary::<i64>("ChunkExposureTime"), None);
    }

    #[test]
    fn incomplete_frames_are_rejected() {
        let (_driver, device) = device();
        let mut contents = contents();
        contents.status = FrameStatus::Incomplete;
        assert!(Frame::load(&device, &contents).is_err());

        let mut contents = self::contents();
        contents.image_size = 64;
        assert!(Frame::load(&device, &contents).is_err());
    }

    #[test]
    fn unknown_formats_have_no_pixels() {
        let (_driver, device) = device();
        let mut contents = contents();
        contents.pixel_format = "BayerRG12".into();
        let frame = Frame::load(&device, &contents).unwrap();
        assert!(Pixels::from_frame(&frame).is_none());
    }

    #[test]
    fn driver_names_translate_both_ways() {
        for format in [
            PixelFormat::Gray8,
            PixelFormat::Rgb24,
            PixelFormat::Bgr24,
            PixelFormat::Rgba32,
            PixelFormat::Bgra32,
            PixelFormat::Yuyv4,
        ] {
            assert_eq!(PixelFormat::from_driver_name(format.driver_name()), Some(format));
        }
        assert_eq!(PixelFormat::from_driver_name("Mono12"), None);
    }
}
