use storage::{sha256_hex, CodeStore, LocalCodeStore, StorageError};
use tempfile::TempDir;

#[tokio::test]
async fn store_and_retrieve_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = LocalCodeStore::new(dir.path()).await.unwrap();

    let code = b"import sys; sys.stdout.write('ok')";
    let location = store.store("fn-1", code).await.unwrap();
    assert_eq!(location, "fn-1/code");

    let read_back = store.retrieve(&location).await.unwrap();
    assert_eq!(read_back, code);
    assert_eq!(sha256_hex(&read_back), sha256_hex(code));
}

#[tokio::test]
async fn store_overwrites_previous_blob() {
    let dir = TempDir::new().unwrap();
    let store = LocalCodeStore::new(dir.path()).await.unwrap();

    let location = store.store("fn-1", b"v1").await.unwrap();
    store.store("fn-1", b"v2").await.unwrap();

    assert_eq!(store.retrieve(&location).await.unwrap(), b"v2");
}

#[tokio::test]
async fn retrieve_missing_location_is_not_found() {
    let dir = TempDir::new().unwrap();
    let store = LocalCodeStore::new(dir.path()).await.unwrap();

    let err = store.retrieve("absent/code").await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
}

#[tokio::test]
async fn delete_removes_blob_and_directory() {
    let dir = TempDir::new().unwrap();
    let store = LocalCodeStore::new(dir.path()).await.unwrap();

    let location = store.store("fn-1", b"code").await.unwrap();
    store.delete(&location).await.unwrap();

    assert!(matches!(
        store.retrieve(&location).await.unwrap_err(),
        StorageError::NotFound(_)
    ));
    assert!(!dir.path().join("fn-1").exists());
}

#[tokio::test]
async fn traversal_locations_are_rejected() {
    let dir = TempDir::new().unwrap();
    let store = LocalCodeStore::new(dir.path()).await.unwrap();

    for loc in ["../outside", "/etc/passwd", ""] {
        assert!(matches!(
            store.retrieve(loc).await.unwrap_err(),
            StorageError::InvalidLocation(_)
        ));
    }
}
