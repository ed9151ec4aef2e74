mod harness;

use std::path::PathBuf;

use common::{
    CompleteFileOptions, CreateDirectoryOptions, CreateFileOptions, DeleteOptions,
    GetStatusOptions, MountOptions, PersistType, PersistenceState, SetAttributeOptions,
};
use harness::{Fixture, p};
use libnamespace::{NamespaceMaster, ROOT_MOUNT_ID};

fn file_opts() -> CreateFileOptions {
    CreateFileOptions {
        create_ancestors: true,
        ..Default::default()
    }
}

async fn populate(master: &NamespaceMaster) {
    master
        .create_directory(&p("/a"), &CreateDirectoryOptions::default())
        .await
        .unwrap();
    master.create_file(&p("/a/b/c"), &file_opts()).await.unwrap();
    master.get_new_block_id_for_file(&p("/a/b/c")).await.unwrap();
    master
        .complete_file(
            &p("/a/b/c"),
            &CompleteFileOptions {
                length: 42,
                ufs_length: None,
            },
        )
        .await
        .unwrap();
    master.create_file(&p("/a/gone"), &file_opts()).await.unwrap();
    master.rename(&p("/a/b/c"), &p("/a/moved")).await.unwrap();
    master
        .delete(&p("/a/gone"), &DeleteOptions::default())
        .await
        .unwrap();
    master
        .set_attribute(
            &p("/a"),
            &SetAttributeOptions {
                pinned: Some(true),
                owner: Some("bob".into()),
                recursive: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
}

fn segments(fx: &Fixture) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = std::fs::read_dir(&fx.config.journal_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("log."))
        })
        .collect();
    out.sort();
    out
}

#[tokio::test]
async fn test_replay_from_genesis() {
    let fx = Fixture::new();
    let before = {
        let master = fx.open().await;
        populate(&master).await;
        master.inodes().await
    };
    let master = fx.open().await;
    assert_eq!(master.inodes().await, before);
    master.validate_tree().await.unwrap();

    let moved = master
        .get_status(&p("/a/moved"), &GetStatusOptions::default())
        .await
        .unwrap();
    assert_eq!(moved.length, 42);
    assert_eq!(moved.owner, "bob");
    assert!(moved.pinned);

    // ids keep growing after recovery
    let max = before.iter().map(|i| i.id).max().unwrap();
    let id = master
        .create_file(&p("/new"), &CreateFileOptions::default())
        .await
        .unwrap();
    assert!(id > max);
}

#[tokio::test]
async fn test_checkpoint_plus_tail() {
    let fx = Fixture::new();
    let before = {
        let master = fx.open().await;
        populate(&master).await;
        master.checkpoint().await.unwrap();
        assert_eq!(segments(&fx).len(), 1);
        master.create_file(&p("/after"), &file_opts()).await.unwrap();
        master
            .complete_file(&p("/after"), &CompleteFileOptions::default())
            .await
            .unwrap();
        master.inodes().await
    };
    let master = fx.open().await;
    assert_eq!(master.inodes().await, before);

    master.shutdown().await.unwrap();
    drop(master);
    let master = fx.open().await;
    assert_eq!(master.inodes().await, before);
}

#[tokio::test]
async fn test_torn_tail_is_discarded() {
    let fx = Fixture::new();
    let before = {
        let master = fx.open().await;
        populate(&master).await;
        let snapshot = master.inodes().await;
        master.create_file(&p("/torn"), &file_opts()).await.unwrap();
        snapshot
    };
    let last = segments(&fx).pop().unwrap();
    let len = std::fs::metadata(&last).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&last).unwrap();
    file.set_len(len - 3).unwrap();
    drop(file);

    let master = fx.open().await;
    assert_eq!(master.inodes().await, before);
    master.create_file(&p("/torn"), &file_opts()).await.unwrap();
    let after = master.inodes().await;
    drop(master);

    let master = fx.open().await;
    assert_eq!(master.inodes().await, after);
}

#[tokio::test]
async fn test_block_ids_survive_restart() {
    let fx = Fixture::new();
    let first = {
        let master = fx.open().await;
        master.create_file(&p("/f"), &file_opts()).await.unwrap();
        master.get_new_block_id_for_file(&p("/f")).await.unwrap()
    };
    let second = {
        let master = fx.open().await;
        let id = master.get_new_block_id_for_file(&p("/f")).await.unwrap();
        master.shutdown().await.unwrap();
        id
    };
    assert!(second > first);

    let master = fx.open().await;
    let third = master.get_new_block_id_for_file(&p("/f")).await.unwrap();
    assert!(third > second);
    let info = master
        .get_status(&p("/f"), &GetStatusOptions::default())
        .await
        .unwrap();
    assert_eq!(info.block_ids, vec![first, second, third]);
}

#[tokio::test]
async fn test_mount_table_restored() {
    let fx = Fixture::new();
    let ext = fx.store("ext");
    fx.store("late");
    {
        let master = fx.open().await;
        master
            .mount(&p("/mnt"), "mem://ext", MountOptions::default())
            .await
            .unwrap();
        master.checkpoint().await.unwrap();
        master
            .mount(&p("/late"), "mem://late", MountOptions::default())
            .await
            .unwrap();
    }
    let master = fx.open().await;
    let table = master.get_mount_table().await;
    let paths: Vec<&str> = table.iter().map(|m| m.path.as_str()).collect();
    assert_eq!(paths, vec!["/", "/late", "/mnt"]);
    assert!(table.iter().any(|m| m.mount_id == ROOT_MOUNT_ID));

    master
        .create_directory(&p("/mnt/x"), &CreateDirectoryOptions::default())
        .await
        .unwrap();
    assert!(ext.exists("/x"));
    let info = master
        .get_status(&p("/mnt"), &GetStatusOptions::default())
        .await
        .unwrap();
    assert!(info.mount_point);
    assert_ne!(info.mount_id, ROOT_MOUNT_ID);
}

#[tokio::test]
async fn test_waiting_files_requeued() {
    let fx = Fixture::new();
    {
        let master = fx.open().await;
        master
            .create_file(
                &p("/async"),
                &CreateFileOptions {
                    persist_type: PersistType::AsyncThrough,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        master
            .complete_file(&p("/async"), &CompleteFileOptions::default())
            .await
            .unwrap();
        assert_eq!(master.persist_backlog(), 1);
    }
    let master = fx.open().await;
    let info = master
        .get_status(&p("/async"), &GetStatusOptions::default())
        .await
        .unwrap();
    assert_eq!(info.persistence_state, PersistenceState::ToBePersisted);
    assert_eq!(master.persist_backlog(), 1);
}
