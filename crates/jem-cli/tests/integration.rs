//! End-to-end tests for the `jem` binary: train -> sample -> score on a
//! tiny synthetic dataset with the NdArray backend.

use std::path::Path;
use std::process::Command;

use serde_json::Value;

const CONFIG: &str = r#"
[model]
hidden_features = 2
num_classes = 3

[sampler]
img_shape = [1, 8, 8]
batch_size = 4
cbuffer_size = 4
max_len = 8
num_steps = 2
seed = 3

[training]
num_epochs = 1
ccond_sample = true
log_interval = 1
"#;

fn jem(args: &[&str]) -> std::process::Output {
    let output = Command::new(env!("CARGO_BIN_EXE_jem"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to spawn jem");
    assert!(
        output.status.success(),
        "jem {args:?} failed:\n{}",
        String::from_utf8_lossy(&output.stderr)
    );
    output
}

fn write_dataset(path: &Path, n: usize) {
    let records: Vec<Value> = (0..n)
        .map(|i| {
            let label = i % 3;
            let pixels: Vec<f32> = (0..64)
                .map(|p| if (p / 8) / 3 == label { 0.9 } else { -0.9 })
                .collect();
            serde_json::json!({ "pixels": pixels, "label": label })
        })
        .collect();
    std::fs::write(path, serde_json::to_string(&records).unwrap()).unwrap();
}

fn s(p: &Path) -> &str {
    p.to_str().unwrap()
}

#[test]
fn test_train_sample_score_roundtrip() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = tmp.path().join("jem.toml");
    std::fs::write(&config, CONFIG).unwrap();
    let data = tmp.path().join("train.json");
    write_dataset(&data, 8);
    let ckpt = tmp.path().join("ckpt");

    jem(&[
        "train",
        "--config", s(&config),
        "--train-data", s(&data),
        "--checkpoint", s(&ckpt),
    ]);
    assert!(ckpt.join("last/model.mpk").exists());
    assert!(ckpt.join("last/meta.json").exists());
    assert!(!ckpt.join("best").exists());
    assert!(ckpt.join("model_config.json").exists());

    let samples = tmp.path().join("out/samples.json");
    jem(&[
        "sample",
        "--config", s(&config),
        "--checkpoint", s(&ckpt),
        "--output", s(&samples),
        "--conditional",
        "--classes", "0,2",
        "--steps", "4",
        "--batch-size", "2",
    ]);
    let out: Value = serde_json::from_str(&std::fs::read_to_string(&samples).unwrap()).unwrap();
    let chains = out["samples"].as_array().unwrap();
    assert_eq!(chains.len(), 2);
    assert_eq!(chains[0]["label"], 0);
    assert_eq!(chains[1]["label"], 2);
    for chain in chains {
        assert_eq!(chain["frame_steps"], serde_json::json!([1, 2, 3, 4]));
        assert_eq!(chain["frames"].as_array().unwrap().len(), 4);
        let finals = chain["final_images"].as_array().unwrap();
        assert_eq!(finals.len(), 2);
        assert!(finals[0]
            .as_array()
            .unwrap()
            .iter()
            .all(|v| (-1.0..=1.0).contains(&v.as_f64().unwrap())));
    }

    let ood = tmp.path().join("ood.json");
    let noise: Vec<Vec<f32>> = (0..4)
        .map(|i| (0..64).map(|p| ((i * 64 + p) as f32 * 0.7).cos()).collect())
        .collect();
    std::fs::write(&ood, serde_json::to_string(&noise).unwrap()).unwrap();

    let report = jem(&[
        "score",
        "--config", s(&config),
        "--checkpoint", s(&ckpt),
        "--input", s(&data),
        "--ood", s(&ood),
        "--score", "py",
    ]);
    let report: Value = serde_json::from_slice(&report.stdout).unwrap();
    assert_eq!(report["kind"], "py");
    assert_eq!(report["scores"].as_array().unwrap().len(), 8);
    assert_eq!(report["predictions"].as_array().unwrap().len(), 8);
    assert_eq!(report["ood_scores"].as_array().unwrap().len(), 4);
    let auc = report["auroc"].as_f64().unwrap();
    assert!((0.0..=1.0).contains(&auc));
    let ap = report["auprc"].as_f64().unwrap();
    assert!((0.0..=1.0).contains(&ap));
}

#[test]
fn test_sample_rejects_unknown_class() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = tmp.path().join("jem.toml");
    std::fs::write(&config, CONFIG).unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_jem"))
        .args([
            "sample",
            "--config", s(&config),
            "--output", s(&tmp.path().join("samples.json")),
            "--conditional",
            "--classes", "5",
            "--steps", "2",
        ])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("out of range"));
}
