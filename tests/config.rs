use meshtune_core::config::RunConfig;
use meshtune_core::data::{train_test_split, DatasetSource, JsonlSource};
use meshtune_core::error::Error;
use meshtune_core::mesh::{DeviceSet, Mesh};
use std::collections::HashSet;
use std::io::Write;

fn write_config(dir: &std::path::Path, num_tpus: usize) -> std::path::PathBuf {
    let path = dir.join("run.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    write!(
        file,
        r#"
[data_config]
data_source = "{data}"
batch_size = 8
max_seq_length = 32

[trainer_config]
model_name = "tiny-causal-lm"
num_tpus = {num_tpus}
mesh_shape = [1, 2, 4]
num_steps = 5
use_lora = true
lora_rank = 4
restore_checkpoint = false

[checkpointer_config]
checkpoint_dir = "{ckpt}"
"#,
        data = dir.join("data").display(),
        num_tpus = num_tpus,
        ckpt = dir.join("ckpt").display(),
    )
    .unwrap();
    path
}

#[test]
fn test_mesh_scenarios_from_config_file() {
    let dir = tempfile::tempdir().unwrap();

    let config = RunConfig::load(&write_config(dir.path(), 8)).unwrap();
    let mesh = Mesh::from_config(&config.trainer_config, &DeviceSet::local(8)).unwrap();
    assert_eq!(mesh.shape(), vec![1, 2, 4]);
    let seen: HashSet<_> = mesh.devices().iter().copied().collect();
    assert_eq!(seen.len(), 8);
    assert_eq!(mesh.degree(&config.trainer_config.data_parallel_axes).unwrap(), 2);

    let err = RunConfig::load(&write_config(dir.path(), 4)).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(err.is_fatal_at_startup());
}

#[test]
fn test_mesh_requires_matching_device_count() {
    let dir = tempfile::tempdir().unwrap();
    let config = RunConfig::load(&write_config(dir.path(), 8)).unwrap();
    assert!(matches!(
        Mesh::from_config(&config.trainer_config, &DeviceSet::local(4)),
        Err(Error::Config(_))
    ));
}

#[tokio::test]
async fn test_split_reproducible_from_jsonl() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("train.jsonl");
    let mut file = std::fs::File::create(&path).unwrap();
    for i in 0..57u32 {
        writeln!(file, "{{\"prompt_ids\": [{}, {}], \"response_ids\": [{}]}}", i, i + 1, i + 2).unwrap();
    }
    drop(file);

    let source = JsonlSource::new(dir.path());
    let first = train_test_split(source.load("train", None).await.unwrap(), 0.15, 42).unwrap();
    let second = train_test_split(source.load("train", None).await.unwrap(), 0.15, 42).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.test.len(), 9);
    assert_eq!(first.train.len(), 48);
}
