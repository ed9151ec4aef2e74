mod harness;

use common::{
    CompleteFileOptions, CreateDirectoryOptions, CreateFileOptions, DeleteOptions, FreeOptions,
    GetStatusOptions, InodeKind, ListStatusOptions, LoadMetadataType, MountOptions, PersistType,
    PersistenceState, SetAttributeOptions, Ttl, TtlAction, TtlSetting,
};
use harness::{BLOCK, Fixture, p};
use libnamespace::{ErrorKind, UnderFileSystem};

const MIB: u64 = 1024 * 1024;

fn never() -> ListStatusOptions {
    ListStatusOptions {
        recursive: false,
        load_metadata: LoadMetadataType::Never,
    }
}

fn with_ancestors() -> CreateFileOptions {
    CreateFileOptions {
        create_ancestors: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_blocks_then_complete() {
    let fx = Fixture::new();
    let master = fx.open().await;
    master
        .create_directory(&p("/a"), &CreateDirectoryOptions::default())
        .await
        .unwrap();
    let file = master
        .create_file(
            &p("/a/b"),
            &CreateFileOptions {
                block_size_bytes: BLOCK,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let b1 = master.get_new_block_id_for_file(&p("/a/b")).await.unwrap();
    let b2 = master.get_new_block_id_for_file(&p("/a/b")).await.unwrap();
    assert!(b1 < b2);

    master
        .complete_file(
            &p("/a/b"),
            &CompleteFileOptions {
                length: 100 * MIB,
                ufs_length: None,
            },
        )
        .await
        .unwrap();
    let info = master
        .get_status(&p("/a/b"), &GetStatusOptions::default())
        .await
        .unwrap();
    assert_eq!(info.file_id, file);
    assert_eq!(info.kind, InodeKind::File);
    assert_eq!(info.length, 100 * MIB);
    assert_eq!(info.block_ids, vec![b1, b2]);
    assert!(info.completed);
    assert_eq!(info.persistence_state, PersistenceState::NotPersisted);
    assert_eq!(info.in_memory_percentage, 100);

    let blocks = master.get_file_block_info_list(&p("/a/b")).await.unwrap();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[1].offset, 64 * MIB);
    assert_eq!(blocks[1].length, 36 * MIB);

    let err = master.get_new_block_id_for_file(&p("/a/b")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileAlreadyCompleted);
    let err = master
        .complete_file(&p("/a/b"), &CompleteFileOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileAlreadyCompleted);
    let err = master
        .complete_file(&p("/a"), &CompleteFileOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IsADirectory);
    let err = master.get_file_block_info_list(&p("/a")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IsADirectory);
}

#[tokio::test]
async fn test_complete_beyond_blocks_rejected() {
    let fx = Fixture::new();
    let master = fx.open().await;
    master
        .create_file(&p("/f"), &CreateFileOptions::default())
        .await
        .unwrap();
    master.get_new_block_id_for_file(&p("/f")).await.unwrap();
    let err = master
        .complete_file(
            &p("/f"),
            &CompleteFileOptions {
                length: BLOCK + 1,
                ufs_length: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    let info = master
        .get_status(&p("/f"), &GetStatusOptions::default())
        .await
        .unwrap();
    assert!(!info.completed);
}

#[tokio::test]
async fn test_delete_requires_recursive() {
    let fx = Fixture::new();
    let master = fx.open().await;
    master
        .create_directory(&p("/a"), &CreateDirectoryOptions::default())
        .await
        .unwrap();
    master
        .create_file(&p("/a/b"), &CreateFileOptions::default())
        .await
        .unwrap();
    let b = master.get_new_block_id_for_file(&p("/a/b")).await.unwrap();
    assert!(fx.root_ufs().exists("/a"));

    let err = master
        .delete(&p("/a"), &DeleteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DirectoryNotEmpty);

    master
        .delete(
            &p("/a"),
            &DeleteOptions {
                recursive: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let err = master
        .get_status(&p("/a"), &GetStatusOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PathNotFound);
    assert!(!fx.root_ufs().exists("/a"));
    assert!(fx.data.evicted().contains(&b));
    master.validate_tree().await.unwrap();
}

#[tokio::test]
async fn test_delete_pinned_needs_force() {
    let fx = Fixture::new();
    let master = fx.open().await;
    master
        .create_file(&p("/d/f"), &with_ancestors())
        .await
        .unwrap();
    master
        .set_attribute(
            &p("/d"),
            &SetAttributeOptions {
                pinned: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let info = master
        .get_status(&p("/d/f"), &GetStatusOptions::default())
        .await
        .unwrap();
    assert!(info.pinned);

    let recursive = DeleteOptions {
        recursive: true,
        ..Default::default()
    };
    let err = master.delete(&p("/d"), &recursive).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    master
        .delete(
            &p("/d"),
            &DeleteOptions {
                forced: true,
                ..recursive
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_create_rules() {
    let fx = Fixture::new();
    let master = fx.open().await;
    let dir = CreateDirectoryOptions::default();
    let id = master.create_directory(&p("/a"), &dir).await.unwrap();

    let err = master.create_directory(&p("/a"), &dir).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    let again = CreateDirectoryOptions {
        allow_exists: true,
        ..Default::default()
    };
    assert_eq!(master.create_directory(&p("/a"), &again).await.unwrap(), id);
    let err = master
        .create_file(
            &p("/a"),
            &CreateFileOptions {
                allow_exists: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    let err = master
        .create_file(&p("/x/y/z"), &CreateFileOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PathNotFound);
    master
        .create_file(&p("/x/y/z"), &with_ancestors())
        .await
        .unwrap();
    let y = master
        .get_status(&p("/x/y"), &GetStatusOptions::default())
        .await
        .unwrap();
    assert!(y.is_directory());
    assert_eq!(y.persistence_state, PersistenceState::NotPersisted);

    let err = master
        .create_file(&p("/x/y/z/w"), &with_ancestors())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotADirectory);
    let err = master
        .create_file(&p("/"), &CreateFileOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    master.validate_tree().await.unwrap();
}

#[tokio::test]
async fn test_ufs_failure_leaves_no_trace() {
    let fx = Fixture::new();
    let master = fx.open().await;
    fx.root_ufs().fail_path("/broken");
    let err = master
        .create_directory(&p("/broken"), &CreateDirectoryOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UfsIoFailure);
    assert!(err.is_io());
    let err = master
        .get_status(&p("/broken"), &GetStatusOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PathNotFound);
    assert!(!master.is_halted());
}

#[tokio::test]
async fn test_rename_and_lookup_by_id() {
    let fx = Fixture::new();
    let master = fx.open().await;
    master
        .create_directory(&p("/a"), &CreateDirectoryOptions::default())
        .await
        .unwrap();
    let id = master
        .create_file(&p("/a/b"), &CreateFileOptions::default())
        .await
        .unwrap();
    master.rename(&p("/a/b"), &p("/a/c")).await.unwrap();

    let info = master.get_status_by_id(id).await.unwrap();
    assert_eq!(info.path, "/a/c");
    assert_eq!(info.name, "c");
    let err = master
        .get_status(&p("/a/b"), &GetStatusOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PathNotFound);

    master
        .create_file(&p("/a/d"), &CreateFileOptions::default())
        .await
        .unwrap();
    let err = master.rename(&p("/a/c"), &p("/a/d")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    let err = master.rename(&p("/a/c"), &p("/nope/c")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PathNotFound);
    let err = master.rename(&p("/a"), &p("/a/e")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidPath);

    // persisted directory moves in UFS too
    master.rename(&p("/a"), &p("/moved")).await.unwrap();
    assert!(fx.root_ufs().exists("/moved"));
    assert!(!fx.root_ufs().exists("/a"));
    assert_eq!(master.get_status_by_id(id).await.unwrap().path, "/moved/c");
    master.validate_tree().await.unwrap();
}

#[tokio::test]
async fn test_rename_across_mounts_rejected() {
    let fx = Fixture::new();
    let master = fx.open().await;
    let ext = fx.store("ext");
    fx.store("other");
    master
        .mount(&p("/mnt"), "mem://ext", MountOptions::default())
        .await
        .unwrap();
    master
        .mount(&p("/other"), "mem://other", MountOptions::default())
        .await
        .unwrap();
    master
        .create_directory(&p("/mnt/x"), &CreateDirectoryOptions::default())
        .await
        .unwrap();
    assert!(ext.exists("/x"));

    let err = master.rename(&p("/mnt/x"), &p("/other/x")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidPath);
    let err = master.rename(&p("/mnt/x"), &p("/x")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidPath);
    let err = master.rename(&p("/mnt"), &p("/elsewhere")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidPath);
    assert!(ext.exists("/x"));
}

#[tokio::test]
async fn test_read_only_mount() {
    let fx = Fixture::new();
    let master = fx.open().await;
    fx.store("ro");
    master
        .mount(
            &p("/ro"),
            "mem://ro",
            MountOptions {
                read_only: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let err = master
        .create_file(&p("/ro/f"), &CreateFileOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
}

#[tokio::test]
async fn test_set_attribute() {
    let fx = Fixture::new();
    let master = fx.open().await;
    master
        .create_file(&p("/d/e/f"), &with_ancestors())
        .await
        .unwrap();

    let err = master
        .set_attribute(&p("/d"), &SetAttributeOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    let err = master
        .set_attribute(
            &p("/d/e/f"),
            &SetAttributeOptions {
                persisted: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    let err = master
        .set_attribute(
            &p("/d/e/f"),
            &SetAttributeOptions {
                persisted: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileNotCompleted);

    master
        .set_attribute(
            &p("/d"),
            &SetAttributeOptions {
                owner: Some("alice".into()),
                mode: Some(0o700),
                recursive: true,
                ttl: Some(TtlSetting::Set(Ttl::new(60_000, TtlAction::Free))),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let d = master
        .get_status(&p("/d"), &GetStatusOptions::default())
        .await
        .unwrap();
    let f = master
        .get_status(&p("/d/e/f"), &GetStatusOptions::default())
        .await
        .unwrap();
    assert_eq!(d.owner, "alice");
    assert_eq!(f.owner, "alice");
    assert_eq!(f.mode, 0o700);
    assert_eq!(d.ttl, Some(Ttl::new(60_000, TtlAction::Free)));
    assert_eq!(f.ttl, None);

    master.complete_file(&p("/d/e/f"), &CompleteFileOptions::default()).await.unwrap();
    master
        .set_attribute(
            &p("/d/e/f"),
            &SetAttributeOptions {
                persisted: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    for path in ["/d", "/d/e", "/d/e/f"] {
        let info = master
            .get_status(&p(path), &GetStatusOptions::default())
            .await
            .unwrap();
        assert!(info.is_persisted(), "{path} should be persisted");
    }
}

#[tokio::test]
async fn test_free_rules() {
    let fx = Fixture::new();
    let master = fx.open().await;
    let through = CreateFileOptions {
        create_ancestors: true,
        persist_type: PersistType::Through,
        ..Default::default()
    };
    master.create_file(&p("/t/f"), &through).await.unwrap();
    assert!(fx.root_ufs().exists("/t"));
    let block = master.get_new_block_id_for_file(&p("/t/f")).await.unwrap();
    let err = master
        .complete_file(
            &p("/t/f"),
            &CompleteFileOptions {
                length: 10,
                ufs_length: Some(11),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    master
        .complete_file(
            &p("/t/f"),
            &CompleteFileOptions {
                length: 10,
                ufs_length: Some(10),
            },
        )
        .await
        .unwrap();
    let t = master
        .get_status(&p("/t"), &GetStatusOptions::default())
        .await
        .unwrap();
    assert!(t.is_persisted());

    master
        .create_file(&p("/t/cached"), &CreateFileOptions::default())
        .await
        .unwrap();
    master
        .complete_file(&p("/t/cached"), &CompleteFileOptions::default())
        .await
        .unwrap();
    let recursive = FreeOptions {
        recursive: true,
        forced: false,
    };
    let err = master.free(&p("/t/cached"), &recursive).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    let err = master.free(&p("/t"), &FreeOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DirectoryNotEmpty);

    master.free(&p("/t/f"), &FreeOptions::default()).await.unwrap();
    let f = master
        .get_status(&p("/t/f"), &GetStatusOptions::default())
        .await
        .unwrap();
    assert_eq!(f.in_memory_percentage, 0);
    assert!(fx.data.evicted().contains(&block));
    // nothing left to free
    master.free(&p("/t/f"), &FreeOptions::default()).await.unwrap();
}

#[tokio::test]
async fn test_list_status_order() {
    let fx = Fixture::new();
    let master = fx.open().await;
    for path in ["/b/2", "/b/1", "/a"] {
        master.create_file(&p(path), &with_ancestors()).await.unwrap();
    }
    let top: Vec<String> = master
        .list_status(&p("/"), &never())
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.path)
        .collect();
    assert_eq!(top, vec!["/a", "/b"]);

    let all: Vec<String> = master
        .list_status(
            &p("/"),
            &ListStatusOptions {
                recursive: true,
                load_metadata: LoadMetadataType::Never,
            },
        )
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.path)
        .collect();
    assert_eq!(all, vec!["/a", "/b", "/b/1", "/b/2"]);

    let file = master.list_status(&p("/a"), &never()).await.unwrap();
    assert_eq!(file.len(), 1);
    assert_eq!(file[0].path, "/a");
}

#[tokio::test]
async fn test_status_loads_from_ufs() {
    let fx = Fixture::new();
    let master = fx.open().await;
    let ufs = fx.root_ufs();
    ufs.create_file("/pre/existing.txt", b"hello").await.unwrap();

    let err = master
        .get_status(&p("/pre/existing.txt"), &GetStatusOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PathNotFound);

    let info = master
        .get_status(
            &p("/pre/existing.txt"),
            &GetStatusOptions {
                load_metadata: LoadMetadataType::Once,
            },
        )
        .await
        .unwrap();
    assert_eq!(info.length, 5);
    assert!(info.completed);
    assert!(info.is_persisted());
    assert_eq!(info.ufs_path, "mem://root/pre/existing.txt");

    let listed = master
        .list_status(&p("/"), &ListStatusOptions::default())
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].path, "/pre");
    master.validate_tree().await.unwrap();
}

#[tokio::test]
async fn test_disjoint_creates_run_concurrently() {
    let fx = Fixture::new();
    let master = fx.open().await;
    let mut tasks = Vec::new();
    for worker in 0..8 {
        let master = master.clone();
        tasks.push(tokio::spawn(async move {
            let dir = format!("/w{worker}");
            master
                .create_directory(&p(&dir), &CreateDirectoryOptions::default())
                .await
                .unwrap();
            for i in 0..20 {
                master
                    .create_file(&p(&format!("{dir}/f{i}")), &CreateFileOptions::default())
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    master.validate_tree().await.unwrap();
    // root plus 8 directories of 20 files
    assert_eq!(master.inodes().await.len(), 1 + 8 * 21);
    let listing = master.list_status(&p("/w3"), &never()).await.unwrap();
    assert_eq!(listing.len(), 20);
}

#[tokio::test]
async fn test_concurrent_renames_keep_tree_valid() {
    let fx = Fixture::new();
    let master = fx.open().await;
    for d in ["/x", "/y"] {
        master
            .create_directory(
                &p(d),
                &CreateDirectoryOptions {
                    persisted: false,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }
    for i in 0..10 {
        master
            .create_file(&p(&format!("/x/f{i}")), &CreateFileOptions::default())
            .await
            .unwrap();
    }
    let mut tasks = Vec::new();
    for i in 0..10 {
        let master = master.clone();
        tasks.push(tokio::spawn(async move {
            master
                .rename(&p(&format!("/x/f{i}")), &p(&format!("/y/g{i}")))
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert!(master.list_status(&p("/x"), &never()).await.unwrap().is_empty());
    assert_eq!(master.list_status(&p("/y"), &never()).await.unwrap().len(), 10);
    master.validate_tree().await.unwrap();
}

#[tokio::test]
async fn test_expired_ttls_apply_their_action() {
    let fx = Fixture::new();
    let master = fx.open().await;
    let short = CreateFileOptions {
        create_ancestors: true,
        ttl: Some(Ttl::new(1_000, TtlAction::Delete)),
        ..Default::default()
    };
    master.create_file(&p("/tmp/x"), &short).await.unwrap();
    let through = CreateFileOptions {
        create_ancestors: true,
        persist_type: PersistType::Through,
        ttl: Some(Ttl::new(1_000, TtlAction::Free)),
        ..Default::default()
    };
    master.create_file(&p("/keep/y"), &through).await.unwrap();
    master.get_new_block_id_for_file(&p("/keep/y")).await.unwrap();
    master
        .complete_file(&p("/keep/y"), &CompleteFileOptions { length: 3, ufs_length: None })
        .await
        .unwrap();
    master
        .create_file(
            &p("/long"),
            &CreateFileOptions {
                ttl: Some(Ttl::new(3_600_000, TtlAction::Delete)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let created = master
        .get_status(&p("/tmp/x"), &GetStatusOptions::default())
        .await
        .unwrap()
        .creation_time_ms;
    assert!(master.expire_ttl(created).await.unwrap().is_empty());

    let expired = master.expire_ttl(created + 60_000).await.unwrap();
    assert_eq!(expired, vec!["/keep/y", "/tmp/x"]);
    let err = master
        .get_status(&p("/tmp/x"), &GetStatusOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PathNotFound);
    let kept = master
        .get_status(&p("/keep/y"), &GetStatusOptions::default())
        .await
        .unwrap();
    assert_eq!(kept.in_memory_percentage, 0);
    assert_eq!(kept.ttl, None);
    master
        .get_status(&p("/long"), &GetStatusOptions::default())
        .await
        .unwrap();

    // freed entries lost their ttl and are not visited again
    assert!(master.expire_ttl(created + 60_000).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_access_time_follows_changes() {
    let fx = Fixture::new();
    let master = fx.open().await;
    master
        .create_directory(&p("/d"), &CreateDirectoryOptions::default())
        .await
        .unwrap();
    let before = master
        .get_status(&p("/d"), &GetStatusOptions::default())
        .await
        .unwrap();
    assert_eq!(before.last_access_time_ms, before.creation_time_ms);

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    master.list_status(&p("/d"), &never()).await.unwrap();
    let read = master
        .get_status(&p("/d"), &GetStatusOptions::default())
        .await
        .unwrap();
    assert_eq!(read.last_access_time_ms, before.last_access_time_ms);

    master
        .create_file(&p("/d/f"), &CreateFileOptions::default())
        .await
        .unwrap();
    let changed = master
        .get_status(&p("/d"), &GetStatusOptions::default())
        .await
        .unwrap();
    assert!(changed.last_access_time_ms > before.last_access_time_ms);
    assert_eq!(changed.last_access_time_ms, changed.last_modification_time_ms);
}
