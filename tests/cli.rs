use std::fs;
use std::process::Command;

use splinecal::model::{CalibrationMethod, SplineCalibrator};
use tempfile::tempdir;

fn training_tsv() -> String {
    let mut data = String::from("label\tscore\n");
    for i in 0..60 {
        let score = i as f64 / 59.0;
        // Positives become more frequent as the score grows.
        let label = u8::from((i * 7) % 10 < i / 6);
        data.push_str(&format!("{label}\t{score}\n"));
    }
    data
}

#[test]
fn fit_apply_and_evaluate_round_trip() {
    let tmp = tempdir().expect("temporary directory");
    let training_path = tmp.path().join("train.tsv");
    let config_path = tmp.path().join("settings.toml");
    let model_path = tmp.path().join("calibrator.toml");
    let scores_path = tmp.path().join("new_scores.tsv");
    let output_path = tmp.path().join("calibrated.tsv");

    fs::write(&training_path, training_tsv()).expect("write training data");
    fs::write(
        &config_path,
        "method = \"ridge\"\nregularization_grid = [0.01, 1.0, 100.0]\n",
    )
    .expect("write config");
    fs::write(&scores_path, "sample_id\tscore\nA\t0.1\nB\t0.5\nC\t1.4\n").expect("write scores");

    let exe = env!("CARGO_BIN_EXE_splinecal");
    let status = Command::new(exe)
        .args([
            "fit",
            training_path.to_str().expect("path str"),
            "--config",
            config_path.to_str().expect("path str"),
            "--max-knots",
            "12",
            "--out",
            model_path.to_str().expect("path str"),
        ])
        .status()
        .expect("run splinecal fit");
    assert!(status.success(), "fit exited with status {status:?}");

    let calibrator =
        SplineCalibrator::load(model_path.to_str().expect("path str")).expect("load calibrator");
    assert_eq!(calibrator.method, CalibrationMethod::Ridge);
    assert_eq!(calibrator.knots.len(), 12);

    let status = Command::new(exe)
        .args([
            "apply",
            scores_path.to_str().expect("path str"),
            "--model",
            model_path.to_str().expect("path str"),
            "--out",
            output_path.to_str().expect("path str"),
        ])
        .status()
        .expect("run splinecal apply");
    assert!(status.success(), "apply exited with status {status:?}");

    let written = fs::read_to_string(&output_path).expect("read predictions");
    let rows: Vec<Vec<&str>> = written.lines().map(|l| l.split('\t').collect()).collect();
    assert_eq!(rows[0], vec!["sample_id", "score", "calibrated_probability"]);
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[3][0], "C");
    for row in &rows[1..] {
        let p: f64 = row[2].parse().expect("numeric probability");
        assert!((0.0..=1.0).contains(&p));
    }

    let output = Command::new(exe)
        .args([
            "evaluate",
            training_path.to_str().expect("path str"),
            "--model",
            model_path.to_str().expect("path str"),
        ])
        .output()
        .expect("run splinecal evaluate");
    assert!(output.status.success());
    let report = String::from_utf8_lossy(&output.stdout);
    assert!(report.contains("calibrated  log-loss"), "unexpected report: {report}");
}

#[test]
fn missing_label_column_fails_with_error_status() {
    let tmp = tempdir().expect("temporary directory");
    let training_path = tmp.path().join("train.tsv");
    fs::write(&training_path, "score\n0.1\n0.2\n").expect("write training data");

    let output = Command::new(env!("CARGO_BIN_EXE_splinecal"))
        .current_dir(tmp.path())
        .args(["fit", training_path.to_str().expect("path str")])
        .output()
        .expect("run splinecal fit");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error:") && stderr.contains("'label'"), "stderr: {stderr}");
}
