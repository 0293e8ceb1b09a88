//! Local backend integration tests
//!
//! Upload-mode semantics, byte-identity round trips, sandbox containment and
//! the setstat policy, all exercised through the facade trait exactly as the
//! request router uses it.

use std::sync::Arc;
use storm_petrel_core::User;
use storm_petrel_sftp::actions::ActionHandler;
use storm_petrel_sftp::config::{SetstatMode, UploadMode};
use storm_petrel_sftp::error::Error;
use storm_petrel_sftp::fs::{
    FsReader as _, FsSettings, FsWriter as _, LocalFs, SetStat, VirtualFs, WriteOptions,
    STAGING_DIR_NAME,
};
use tempfile::TempDir;

fn backend(dir: &TempDir, upload_mode: UploadMode, setstat_mode: SetstatMode) -> LocalFs {
    let user = User::with_full_access("alice", dir.path());
    LocalFs::new(
        user,
        "00c0ffee".to_string(),
        FsSettings {
            upload_mode,
            setstat_mode,
            ..Default::default()
        },
        Arc::new(ActionHandler::default()),
    )
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
    // deliberately odd chunking so offsets do not line up with anything
    let mut offset = 0u64;
    for chunk in data.chunks(733) {
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
        let chunk = reader.read_at(offset, 32 * 1024).await.unwrap();
        if chunk.is_empty() {
            break;
        }
        offset += chunk.len() as u64;
        data.extend_from_slice(&chunk);
    }
    data
}

fn leftover_temp_files(dir: &TempDir) -> Vec<String> {
    std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| name.ends_with(".part"))
        .collect()
}

#[tokio::test]
async fn test_round_trip_byte_identity_across_sizes() {
    let dir = TempDir::new().unwrap();
    let fs = backend(&dir, UploadMode::Atomic, SetstatMode::Apply);
    fs.check_root().await.unwrap();

    for (i, size) in [0usize, 1, 4095, 4096, 4097, 40960].iter().enumerate() {
        let data: Vec<u8> = (0..*size).map(|n| (n % 251) as u8).collect();
        let path = format!("/file-{}.bin", i);
        upload(&fs, &path, &data).await;
        assert_eq!(download(&fs, &path).await, data, "size {}", size);
    }
    assert!(leftover_temp_files(&dir).is_empty());
}

#[tokio::test]
async fn test_atomic_upload_invisible_until_commit() {
    let dir = TempDir::new().unwrap();
    let fs = backend(&dir, UploadMode::Atomic, SetstatMode::Apply);
    fs.check_root().await.unwrap();

    let mut writer = fs
        .open_write(
            "/f.bin",
            WriteOptions {
                create: true,
                truncate: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    writer.write_at(0, &[9u8; 1024]).await.unwrap();

    // mid-upload the target path must not exist
    assert!(!dir.path().join("f.bin").exists());

    writer.commit().await.unwrap();
    assert_eq!(std::fs::read(dir.path().join("f.bin")).unwrap(), [9u8; 1024]);
    assert!(leftover_temp_files(&dir).is_empty());
}

#[tokio::test]
async fn test_atomic_abort_deletes_temporary() {
    let dir = TempDir::new().unwrap();
    let fs = backend(&dir, UploadMode::Atomic, SetstatMode::Apply);
    fs.check_root().await.unwrap();

    let mut writer = fs
        .open_write(
            "/f.bin",
            WriteOptions {
                create: true,
                truncate: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    writer.write_at(0, b"partial").await.unwrap();
    writer.abort().await.unwrap();

    assert!(!dir.path().join("f.bin").exists());
    assert!(leftover_temp_files(&dir).is_empty());
}

#[tokio::test]
async fn test_resume_mode_keeps_partial_at_target() {
    let dir = TempDir::new().unwrap();
    let fs = backend(&dir, UploadMode::AtomicWithResume, SetstatMode::Apply);
    fs.check_root().await.unwrap();

    let mut writer = fs
        .open_write(
            "/f.bin",
            WriteOptions {
                create: true,
                truncate: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    writer.write_at(0, b"half of the").await.unwrap();
    // simulated disconnect
    writer.abort().await.unwrap();

    // the partial lands at the target path so the client can resume
    assert_eq!(
        std::fs::read(dir.path().join("f.bin")).unwrap(),
        b"half of the"
    );

    // a later session overwrites it completely
    upload(&fs, "/f.bin", b"the whole payload").await;
    assert_eq!(download(&fs, "/f.bin").await, b"the whole payload");
}

#[tokio::test]
async fn test_direct_mode_writes_final_path() {
    let dir = TempDir::new().unwrap();
    let fs = backend(&dir, UploadMode::Direct, SetstatMode::Apply);
    fs.check_root().await.unwrap();

    let mut writer = fs
        .open_write(
            "/f.bin",
            WriteOptions {
                create: true,
                truncate: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    writer.write_at(0, b"visible").await.unwrap();
    // direct mode exposes the bytes immediately
    assert!(dir.path().join("f.bin").exists());
    writer.commit().await.unwrap();
}

#[tokio::test]
async fn test_rename_round_trip_restores_namespace() {
    let dir = TempDir::new().unwrap();
    let fs = backend(&dir, UploadMode::Direct, SetstatMode::Apply);
    fs.check_root().await.unwrap();
    upload(&fs, "/a.txt", b"payload").await;

    fs.rename("/a.txt", "/b.txt").await.unwrap();
    assert!(fs.stat("/a.txt").await.is_err());
    assert_eq!(download(&fs, "/b.txt").await, b"payload");

    fs.rename("/b.txt", "/a.txt").await.unwrap();
    assert!(fs.stat("/b.txt").await.is_err());
    assert_eq!(download(&fs, "/a.txt").await, b"payload");
}

#[cfg(unix)]
#[tokio::test]
async fn test_setstat_ignore_mode_is_observable_noop() {
    let dir = TempDir::new().unwrap();
    let fs = backend(&dir, UploadMode::Direct, SetstatMode::Ignore);
    fs.check_root().await.unwrap();
    upload(&fs, "/f.txt", b"x").await;

    let before = fs.stat("/f.txt").await.unwrap().permissions;
    fs.set_stat(
        "/f.txt",
        &SetStat {
            permissions: Some(0o600),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let after = fs.stat("/f.txt").await.unwrap().permissions;
    assert_eq!(before, after);
}

#[cfg(unix)]
#[tokio::test]
async fn test_setstat_apply_mode_changes_permissions() {
    let dir = TempDir::new().unwrap();
    let fs = backend(&dir, UploadMode::Direct, SetstatMode::Apply);
    fs.check_root().await.unwrap();
    upload(&fs, "/f.txt", b"x").await;

    fs.set_stat(
        "/f.txt",
        &SetStat {
            permissions: Some(0o600),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(fs.stat("/f.txt").await.unwrap().permissions & 0o777, 0o600);
}

#[tokio::test]
async fn test_setstat_truncate() {
    let dir = TempDir::new().unwrap();
    let fs = backend(&dir, UploadMode::Direct, SetstatMode::Apply);
    fs.check_root().await.unwrap();
    upload(&fs, "/f.txt", b"0123456789").await;

    fs.set_stat(
        "/f.txt",
        &SetStat {
            size: Some(4),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(download(&fs, "/f.txt").await, b"0123");
}

#[tokio::test]
async fn test_rmdir_refuses_non_empty_directory() {
    let dir = TempDir::new().unwrap();
    let fs = backend(&dir, UploadMode::Direct, SetstatMode::Apply);
    fs.check_root().await.unwrap();

    fs.make_dir("/docs").await.unwrap();
    upload(&fs, "/docs/a.txt", b"x").await;

    assert!(fs.remove_dir("/docs").await.is_err());
    assert!(fs.stat("/docs/a.txt").await.is_ok());

    fs.remove_file("/docs/a.txt").await.unwrap();
    fs.remove_dir("/docs").await.unwrap();
    assert!(fs.stat("/docs").await.is_err());
}

#[tokio::test]
async fn test_key_prefix_scopes_the_view() {
    let dir = TempDir::new().unwrap();
    let mut user = User::with_full_access("alice", dir.path());
    user.key_prefix = "tenant-a".to_string();
    let fs = LocalFs::new(
        user,
        "00c0ffef".to_string(),
        FsSettings::default(),
        Arc::new(ActionHandler::default()),
    );
    fs.check_root().await.unwrap();

    upload(&fs, "/hello.txt", b"scoped").await;

    // on disk the file lives under the prefix
    assert!(dir.path().join("tenant-a/hello.txt").exists());

    // the user's view is rooted inside the prefix
    let listing = fs.list_dir("/").await.unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name, "hello.txt");
}

#[tokio::test]
async fn test_path_escape_attempts_stay_inside_home() {
    let dir = TempDir::new().unwrap();
    let fs = backend(&dir, UploadMode::Direct, SetstatMode::Apply);
    fs.check_root().await.unwrap();
    upload(&fs, "/inside.txt", b"data").await;

    // lexical escapes resolve back into the sandbox
    assert_eq!(
        download(&fs, "/../../inside.txt").await,
        b"data"
    );
    assert!(matches!(
        fs.open_read("/../../../etc/passwd").await.err().unwrap(),
        Error::NotFound(_)
    ));
}

#[tokio::test]
async fn test_staging_directory_created_and_hidden() {
    let dir = TempDir::new().unwrap();
    let fs = backend(&dir, UploadMode::Atomic, SetstatMode::Apply);
    fs.check_root().await.unwrap();

    assert!(dir.path().join(STAGING_DIR_NAME).is_dir());
    let names: Vec<String> = fs
        .list_dir("/")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert!(!names.contains(&STAGING_DIR_NAME.to_string()));
}

#[tokio::test]
async fn test_symlink_and_readlink() {
    #[cfg(unix)]
    {
        let dir = TempDir::new().unwrap();
        let fs = backend(&dir, UploadMode::Direct, SetstatMode::Apply);
        fs.check_root().await.unwrap();
        upload(&fs, "/target.txt", b"t").await;

        fs.symlink("/target.txt", "/link.txt").await.unwrap();
        let target = fs.read_link("/link.txt").await.unwrap();
        assert!(target.ends_with("target.txt"));

        let info = fs.lstat("/link.txt").await.unwrap();
        assert_eq!(info.kind, storm_petrel_sftp::fs::FileKind::Symlink);
    }
}
