//! Object backend integration tests
//!
//! Runs the facade against the in-memory object store with a small part
//! size so multipart boundaries are exercised, and pins down the semantic
//! differences from local disk: implicit atomicity, copy-plus-delete rename,
//! refused non-empty directory renames, and unsupported symlinks/times.

use std::sync::Arc;
use storm_petrel_core::{StorageKind, User};
use storm_petrel_sftp::actions::ActionHandler;
use storm_petrel_sftp::error::Error;
use storm_petrel_sftp::fs::{
    FsReader as _, FsSettings, FsWriter as _, MemoryObjectStore, ObjectFs, SetStat, VirtualFs,
    WriteOptions,
};
use tempfile::TempDir;

const PART_SIZE: usize = 1024;

struct Fixture {
    fs: ObjectFs,
    store: Arc<MemoryObjectStore>,
    _home: TempDir,
}

fn fixture(key_prefix: &str) -> Fixture {
    let home = TempDir::new().unwrap();
    let mut user = User::with_full_access("alice", home.path());
    user.storage = StorageKind::Object;
    user.key_prefix = key_prefix.to_string();

    let store = Arc::new(MemoryObjectStore::new());
    let fs = ObjectFs::new(
        user,
        "0b1ec7".to_string(),
        FsSettings {
            part_size: PART_SIZE,
            ..Default::default()
        },
        Arc::clone(&store) as Arc<dyn storm_petrel_sftp::fs::ObjectStore>,
        Arc::new(ActionHandler::default()),
    );
    Fixture {
        fs,
        store,
        _home: home,
    }
}

async fn upload(fs: &dyn VirtualFs, path: &str, data: &[u8]) {
    let mut writer = fs
        .open_write(
            path,
            WriteOptions {
                create: true,
                truncate: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let mut offset = 0u64;
    for chunk in data.chunks(333) {
        writer.write_at(offset, chunk).await.unwrap();
        offset += chunk.len() as u64;
    }
    writer.commit().await.unwrap();
}

async fn download(fs: &dyn VirtualFs, path: &str) -> Vec<u8> {
    let mut reader = fs.open_read(path).await.unwrap();
    let mut data = Vec::new();
    let mut offset = 0u64;
    loop {
        let chunk = reader.read_at(offset, 8 * 1024).await.unwrap();
        if chunk.is_empty() {
            break;
        }
        offset += chunk.len() as u64;
        data.extend_from_slice(&chunk);
    }
    data
}

#[tokio::test]
async fn test_round_trip_across_part_boundaries() {
    let fx = fixture("");

    for (i, size) in [
        0usize,
        1,
        PART_SIZE - 1,
        PART_SIZE,
        PART_SIZE + 1,
        10 * PART_SIZE,
    ]
    .iter()
    .enumerate()
    {
        let data: Vec<u8> = (0..*size).map(|n| (n % 239) as u8).collect();
        let path = format!("/file-{}.bin", i);
        upload(&fx.fs, &path, &data).await;
        assert_eq!(download(&fx.fs, &path).await, data, "size {}", size);
        assert_eq!(fx.fs.stat(&path).await.unwrap().size, *size as u64);
    }
    assert_eq!(fx.store.pending_uploads().await, 0);
}

#[tokio::test]
async fn test_upload_is_implicitly_atomic() {
    let fx = fixture("");

    let mut writer = fx
        .fs
        .open_write(
            "/big.bin",
            WriteOptions {
                create: true,
                truncate: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    writer.write_at(0, &vec![5u8; 3 * PART_SIZE]).await.unwrap();

    // parts are uploaded but nothing is visible at the key yet
    assert!(fx.store.contents("big.bin").await.is_none());

    writer.commit().await.unwrap();
    assert_eq!(
        fx.store.contents("big.bin").await.unwrap(),
        vec![5u8; 3 * PART_SIZE]
    );
}

#[tokio::test]
async fn test_aborted_upload_leaves_nothing() {
    let fx = fixture("");

    let mut writer = fx
        .fs
        .open_write(
            "/gone.bin",
            WriteOptions {
                create: true,
                truncate: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    writer.write_at(0, &vec![1u8; 2 * PART_SIZE]).await.unwrap();
    writer.abort().await.unwrap();

    assert!(fx.store.contents("gone.bin").await.is_none());
    assert_eq!(fx.store.pending_uploads().await, 0);
}

#[tokio::test]
async fn test_out_of_order_writes_rejected() {
    let fx = fixture("");

    let mut writer = fx
        .fs
        .open_write(
            "/seq.bin",
            WriteOptions {
                create: true,
                truncate: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    writer.write_at(0, b"abc").await.unwrap();
    assert!(matches!(
        writer.write_at(100, b"xyz").await,
        Err(Error::Unsupported(_))
    ));
    writer.abort().await.unwrap();
}

#[tokio::test]
async fn test_append_unsupported() {
    let fx = fixture("");
    assert!(matches!(
        fx.fs
            .open_write(
                "/resume.bin",
                WriteOptions {
                    append: true,
                    create: true,
                    ..Default::default()
                },
            )
            .await
            .err()
            .unwrap(),
        Error::Unsupported(_)
    ));
}

#[tokio::test]
async fn test_rename_is_copy_then_delete() {
    let fx = fixture("");
    upload(&fx.fs, "/a.bin", b"payload").await;

    fx.fs.rename("/a.bin", "/b.bin").await.unwrap();
    assert!(fx.store.contents("a.bin").await.is_none());
    assert_eq!(fx.store.contents("b.bin").await.unwrap(), b"payload");
}

#[tokio::test]
async fn test_rename_non_empty_directory_fails_and_preserves_source() {
    let fx = fixture("");
    fx.fs.make_dir("/dir").await.unwrap();
    upload(&fx.fs, "/dir/child.txt", b"kept").await;

    let err = fx.fs.rename("/dir", "/moved").await.err().unwrap();
    assert!(matches!(err, Error::Unsupported(_)));

    // source contents unchanged
    assert_eq!(download(&fx.fs, "/dir/child.txt").await, b"kept");
    assert!(fx.fs.stat("/moved").await.is_err());
}

#[tokio::test]
async fn test_rename_empty_directory_moves_marker() {
    let fx = fixture("");
    fx.fs.make_dir("/empty").await.unwrap();

    fx.fs.rename("/empty", "/renamed").await.unwrap();
    assert!(fx.fs.stat("/empty").await.is_err());
    assert!(fx.fs.stat("/renamed").await.unwrap().is_dir());
}

#[tokio::test]
async fn test_directory_listing_with_implicit_dirs() {
    let fx = fixture("");
    upload(&fx.fs, "/top.txt", b"1").await;
    // no explicit mkdir: the directory exists because a deeper key does
    upload(&fx.fs, "/photos/cat.jpg", b"2").await;

    let names: Vec<String> = fx
        .fs
        .list_dir("/")
        .await
        .unwrap()
        .into_iter()
        .map(|e| format!("{}{}", e.name, if e.is_dir() { "/" } else { "" }))
        .collect();
    assert_eq!(names, vec!["photos/", "top.txt"]);

    let inner = fx.fs.list_dir("/photos").await.unwrap();
    assert_eq!(inner.len(), 1);
    assert_eq!(inner[0].name, "cat.jpg");
}

#[tokio::test]
async fn test_rmdir_semantics() {
    let fx = fixture("");
    fx.fs.make_dir("/d").await.unwrap();
    upload(&fx.fs, "/d/f", b"x").await;

    assert!(fx.fs.remove_dir("/d").await.is_err());
    fx.fs.remove_file("/d/f").await.unwrap();
    fx.fs.remove_dir("/d").await.unwrap();
    assert!(fx.fs.stat("/d").await.is_err());

    assert!(matches!(
        fx.fs.remove_dir("/never-existed").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_mkdir_existing_fails() {
    let fx = fixture("");
    fx.fs.make_dir("/d").await.unwrap();
    assert!(fx.fs.make_dir("/d").await.is_err());

    upload(&fx.fs, "/f", b"x").await;
    assert!(fx.fs.make_dir("/f").await.is_err());
}

#[tokio::test]
async fn test_symlinks_and_times_unsupported_chmod_ignored() {
    let fx = fixture("");
    upload(&fx.fs, "/f", b"x").await;

    assert!(matches!(
        fx.fs.symlink("/f", "/l").await,
        Err(Error::Unsupported(_))
    ));
    assert!(matches!(
        fx.fs.read_link("/f").await,
        Err(Error::Unsupported(_))
    ));
    assert!(matches!(
        fx.fs
            .set_stat(
                "/f",
                &SetStat {
                    mtime: Some(1_700_000_000),
                    atime: Some(1_700_000_000),
                    ..Default::default()
                },
            )
            .await,
        Err(Error::Unsupported(_))
    ));

    // chmod / chown are silently accepted and ignored
    fx.fs
        .set_stat(
            "/f",
            &SetStat {
                permissions: Some(0o600),
                uid: Some(1000),
                gid: Some(1000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(fx.fs.stat("/f").await.unwrap().permissions, 0o644);
}

#[tokio::test]
async fn test_key_prefix_sandboxing() {
    let fx = fixture("tenants/alpha");
    fx.fs.check_root().await.unwrap();
    upload(&fx.fs, "/doc.txt", b"scoped").await;

    // the object key carries the prefix
    assert_eq!(
        fx.store.contents("tenants/alpha/doc.txt").await.unwrap(),
        b"scoped"
    );

    // a sibling tenant's object is invisible in this view
    fx.store
        .put("tenants/beta/secret.txt", b"other".to_vec())
        .await
        .unwrap();
    assert!(fx.fs.stat("/secret.txt").await.is_err());
    let names: Vec<String> = fx
        .fs
        .list_dir("/")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["doc.txt"]);
}

#[tokio::test]
async fn test_exclusive_create_on_existing_object() {
    let fx = fixture("");
    upload(&fx.fs, "/f", b"x").await;
    assert!(fx
        .fs
        .open_write(
            "/f",
            WriteOptions {
                create: true,
                truncate: true,
                exclusive: true,
                ..Default::default()
            },
        )
        .await
        .is_err());
}
