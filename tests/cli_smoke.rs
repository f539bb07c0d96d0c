use std::path::PathBuf;

fn exe() -> PathBuf {
    std::env::var_os("CARGO_BIN_EXE_rasterfx")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let mut p = PathBuf::from("target").join("debug");
            p.push(if cfg!(windows) {
                "rasterfx.exe"
            } else {
                "rasterfx"
            });
            p
        })
}

#[test]
fn cli_copy_round_trips_png() {
    let dir = PathBuf::from("target").join("cli_smoke");
    std::fs::create_dir_all(&dir).unwrap();

    let in_path = dir.join("in.png");
    let out_path = dir.join("out.png");
    let _ = std::fs::remove_file(&out_path);

    let img = image::RgbaImage::from_fn(12, 7, |x, y| {
        image::Rgba([(x * 20) as u8, (y * 30) as u8, 99, 255])
    });
    img.save(&in_path).unwrap();

    let in_arg = in_path.to_string_lossy().to_string();
    let out_arg = out_path.to_string_lossy().to_string();
    let status = std::process::Command::new(exe())
        .args(["--tile-size", "64", "copy", "--in", in_arg.as_str(), "--out"])
        .arg(out_arg.as_str())
        .status()
        .unwrap();

    assert!(status.success());
    let copied = image::open(&out_path).unwrap().to_rgba8();
    assert_eq!(copied, img);
}

#[test]
fn cli_probe_software_succeeds() {
    let output = std::process::Command::new(exe())
        .args(["--tile-size", "256", "probe", "--backend", "software"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("max_texture_size: 16384"));
    assert!(stdout.contains("precision: mediump"));
}

#[test]
fn cli_rejects_oversized_copy() {
    let dir = PathBuf::from("target").join("cli_smoke_oversized");
    std::fs::create_dir_all(&dir).unwrap();
    let in_path = dir.join("in.png");
    image::RgbaImage::from_pixel(20, 20, image::Rgba([1, 2, 3, 255]))
        .save(&in_path)
        .unwrap();

    let in_arg = in_path.to_string_lossy().to_string();
    let out_arg = dir.join("out.png").to_string_lossy().to_string();
    let status = std::process::Command::new(exe())
        .args(["--tile-size", "8", "copy", "--in", in_arg.as_str(), "--out"])
        .arg(out_arg.as_str())
        .status()
        .unwrap();

    assert!(!status.success());
}
