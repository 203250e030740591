use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use gaitflow::config::DescriptorLoader;
use gaitflow::domain::{Stage, SubjectId};
use gaitflow::error::PipelineError;

const DESCRIPTOR: &str = r#"{
    "name": "exo-walking",
    "root": "data",
    "subjects": [3, 7],
    "subject_prefix": "P",
    "context_parameters": [
        {"name": "assistance", "values": [0, 1]},
        {"name": "speed", "values": [1, 2, 3]},
        {"name": "side", "values": [1, 2]}
    ],
    "model_parameter": "assistance",
    "models": {"0": "gait.osim", "1": "gait_exo.osim"},
    "loads": {"0": "loads.xml", "1": "loads_exo.xml"},
    "tools": {"kinematics-fit": "/opt/opensim/bin/ik"},
    "batch": {"workers": 4, "min_available_memory": 0.2}
}"#;

#[test]
fn resolve_descriptor_from_file() {
    let temp = tempfile::tempdir().unwrap();
    let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let path = dir.join("gaitflow.json");
    fs::write(&path, DESCRIPTOR).unwrap();

    let dataset = DescriptorLoader::resolve(Some(path.as_str())).unwrap();
    assert_eq!(dataset.name, "exo-walking");
    assert_eq!(dataset.root, dir.join("data"));
    assert_eq!(dataset.subjects, vec![SubjectId(3), SubjectId(7)]);
    assert_eq!(dataset.space.combination_count(), 12);
    assert_eq!(dataset.space.model_parameter().name, "assistance");
    assert_eq!(dataset.model_file(1).unwrap(), "gait_exo.osim");
    assert_eq!(dataset.load_file(0).unwrap(), "loads.xml");
    assert_eq!(dataset.batch.workers, Some(4));
    assert_eq!(dataset.batch.min_available_memory, 0.2);
    assert!(!dataset.batch.skip_completed);
    assert_eq!(dataset.naming.stage_folder(Stage::JointSpaceForces), "JSF");
}

#[test]
fn unreadable_and_malformed_descriptors() {
    let temp = tempfile::tempdir().unwrap();
    let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();

    let missing = dir.join("absent.json");
    assert_matches!(
        DescriptorLoader::resolve(Some(missing.as_str())),
        Err(PipelineError::DescriptorRead(path)) if path == missing
    );

    let broken = dir.join("broken.json");
    fs::write(&broken, "{ \"name\": ").unwrap();
    assert_matches!(
        DescriptorLoader::resolve(Some(broken.as_str())),
        Err(PipelineError::DescriptorParse(_))
    );
}

#[test]
fn invalid_settings_are_configuration_errors() {
    let temp = tempfile::tempdir().unwrap();
    let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let cases = [
        DESCRIPTOR.replace("\"subjects\": [3, 7]", "\"subjects\": [3, 3]"),
        DESCRIPTOR.replace("\"values\": [1, 2, 3]", "\"values\": []"),
        DESCRIPTOR.replace("\"min_available_memory\": 0.2", "\"min_available_memory\": 1.5"),
        DESCRIPTOR.replace("\"workers\": 4", "\"workers\": 0"),
    ];
    for (index, content) in cases.iter().enumerate() {
        let path = dir.join(format!("case{index}.json"));
        fs::write(&path, content).unwrap();
        assert_matches!(
            DescriptorLoader::resolve(Some(path.as_str())),
            Err(PipelineError::Configuration(_)),
            "case {index}"
        );
    }
}
