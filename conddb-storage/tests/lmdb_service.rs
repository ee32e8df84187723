//! Access service over an LMDB database built from a connection string.

use conddb_core::{ChannelId, CondDbConfig, Iov, StorageType, VersioningMode};
use conddb_storage::{CondDbAccessSvc, CondDbEditor, CondDbInfo, CondDbReader};
use conddb_test_utils::assertions::*;
use conddb_test_utils::fixtures::{iov, key, xml, ALIGNMENT, VELO};
use std::path::Path;

const CH0: ChannelId = ChannelId::new(0);

fn lmdb_config(dir: &Path) -> CondDbConfig {
    CondDbConfig {
        connection_timeout_secs: 0,
        check_tag_timeout_secs: 0,
        ..CondDbConfig::with_connection(format!(
            "lmdb://local;schema={};dbname=DDDB;",
            dir.display()
        ))
    }
}

fn populate(dir: &Path) {
    let config = CondDbConfig {
        read_only: false,
        ..lmdb_config(dir)
    };
    let svc = CondDbAccessSvc::from_config(config).unwrap();
    svc.initialize().unwrap();

    svc.create_folder_set(VELO, "Vertex locator").unwrap();
    svc.create_node(
        ALIGNMENT,
        "Velo alignment",
        StorageType::Xml,
        VersioningMode::MultiVersion,
    )
    .unwrap();
    svc.store_xml_data(ALIGNMENT, &xml(1), key(0), key(100), CH0)
        .unwrap();
    svc.store_xml_data(ALIGNMENT, &xml(2), key(100), key(200), CH0)
        .unwrap();
    svc.set_channel_name(ALIGNMENT, CH0, "Module0").unwrap();
    svc.recursive_tag("/Conditions", "lmdb-v1", "first release").unwrap();

    // Newer HEAD data, not part of the tag.
    svc.store_xml_data(ALIGNMENT, &xml(3), key(50), key(150), CH0)
        .unwrap();
    svc.finalize().unwrap();
}

#[test]
fn test_data_persists_across_services() {
    let dir = tempfile::tempdir().unwrap();
    populate(dir.path());

    let svc = CondDbAccessSvc::from_config(lmdb_config(dir.path())).unwrap();
    assert!(svc.connection().target().starts_with("lmdb:"));
    svc.initialize().unwrap();

    let head = svc.get_object(ALIGNMENT, key(120), CH0).unwrap();
    assert_eq!(head.payload.xml_data(), Some(xml(3).as_str()));
    assert_eq!(head.description, "Velo alignment");

    let iovs = svc.get_iovs(ALIGNMENT, &Iov::unbounded(), CH0).unwrap();
    assert_eq!(iovs, vec![iov(0, 50), iov(50, 150), iov(150, 200)]);

    let by_name = svc.get_object_by_name(ALIGNMENT, key(10), "Module0").unwrap();
    assert_eq!(by_name.payload.xml_data(), Some(xml(1).as_str()));

    let velo = svc.child_nodes(VELO).unwrap();
    assert_eq!(velo.leaves, vec!["Alignment".to_string()]);
    assert_wrong_node_type(&svc.get_object(VELO, key(10), CH0));
    svc.finalize().unwrap();
}

#[test]
fn test_tagged_snapshot_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    populate(dir.path());

    let config = CondDbConfig {
        default_tag: "lmdb-v1".to_string(),
        ..lmdb_config(dir.path())
    };
    let svc = CondDbAccessSvc::from_config(config).unwrap();
    svc.initialize().unwrap();

    let tagged = svc.get_object(ALIGNMENT, key(120), CH0).unwrap();
    assert_eq!(tagged.payload.xml_data(), Some(xml(2).as_str()));
    let iovs = svc.get_iovs(ALIGNMENT, &Iov::unbounded(), CH0).unwrap();
    assert_eq!(iovs, vec![iov(0, 100), iov(100, 200)]);

    assert_tag_not_found(&svc.set_default_tag("lmdb-v2"));
    assert_eq!(svc.tag(), "lmdb-v1");
}

#[test]
fn test_read_only_lmdb_service_refuses_writes() {
    let dir = tempfile::tempdir().unwrap();
    let svc = CondDbAccessSvc::from_config(lmdb_config(dir.path())).unwrap();
    svc.initialize().unwrap();
    assert_read_only(&svc.create_folder_set(VELO, ""));
    assert!(svc.exists("/").unwrap());
    assert!(!svc.exists(VELO).unwrap());
}
