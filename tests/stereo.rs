//! # Stereo Camera Test
//!
//! Designed to test stereo camera display, needs two cameras plugged in and a display.
//!
//! Run with `cargo test --test stereo -- --ignored`.

use std::sync::{Arc, Mutex};

use image::RgbImage;
use minifb::{Key, Window, WindowOptions};
use stereo_camstream::prelude::*;

const WIDTH: usize = 640 * 2;
const HEIGHT: usize = 480;

// -----------------------------------------------------------------------------------------------
// MAIN
// -----------------------------------------------------------------------------------------------

#[test]
#[ignore]
fn stereo() -> Result<(), Box<dyn std::error::Error>> {
    let camstream = CamStreamBuilder::new()
        .stereo()
        .left_path("/dev/video0")?
        .right_path("/dev/video2")?
        .fps(30)
        .resolution((640, 480))
        .format(b"MJPG")?
        .build()?;

    let latest: Arc<Mutex<Option<(RgbImage, RgbImage)>>> = Arc::new(Mutex::new(None));
    let sink_latest = latest.clone();

    let config = PipelineConfig {
        publish_raw: false,
        publish_rect: true,
        ..PipelineConfig::default()
    };

    let mut pipeline = PipelineDriver::new(camstream, config)
        .calibration_from_file(concat!(env!("CARGO_MANIFEST_DIR"), "/res/m2_calibration.yml"))?
        .with_sink(move |pair: &StereoFrame, _kind: FrameKind| -> stereo_camstream::Result<()> {
            if let Ok(mut latest) = sink_latest.lock() {
                *latest = Some((pair.left.image.clone(), pair.right.image.clone()));
            }
            Ok(())
        });

    let stop = pipeline.stop_handle();
    let runner = std::thread::spawn(move || pipeline.run());

    let mut buffer: Vec<u32> = vec![0; WIDTH * HEIGHT];

    let mut window = Window::new(
        "Stereo Camera Stream",
        WIDTH,
        HEIGHT,
        WindowOptions::default(),
    )?;

    window.limit_update_rate(Some(std::time::Duration::from_micros(16600)));

    while window.is_open() && !window.is_key_down(Key::Escape) && !stop.is_stopped() {
        if let Some((left, right)) = latest.lock().unwrap().take() {
            for y in 0..HEIGHT {
                for x in 0..WIDTH {
                    let (img, ix) = if x >= WIDTH / 2 {
                        (&right, x - WIDTH / 2)
                    } else {
                        (&left, x)
                    };

                    buffer[x + y * WIDTH] = if (ix as u32) < img.width() && (y as u32) < img.height() {
                        rgb_to_u32(img.get_pixel(ix as u32, y as u32))
                    } else {
                        0
                    };
                }
            }
        }

        window.update_with_buffer(&buffer, WIDTH, HEIGHT)?;
    }

    stop.stop();
    let summary = runner.join().unwrap()?;
    assert!(summary.succeeded());

    Ok(())
}

fn rgb_to_u32(rgb: &image::Rgb<u8>) -> u32 {
    (rgb[0] as u32) << 16 | (rgb[1] as u32) << 8 | rgb[2] as u32
}
