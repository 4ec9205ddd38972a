//! The notebook engine driven by on-disk storage and age encryption.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use quill_core::{
    BlockType, CommandRunner, EncryptionState, EngineConfig, EngineEvent, Language,
    NotebookEngine,
};
use quill_vault::{
    AgeEncryptionService, Credential, CredentialsFile, DiskFileStore, NotebookIndex, VaultConfig,
    generate_identity, init_vault, is_armored,
};
use tempfile::TempDir;

struct Vault {
    _temp: TempDir,
    root: PathBuf,
    engine: NotebookEngine,
}

fn engine_for(root: &Path, crypto: AgeEncryptionService) -> NotebookEngine {
    NotebookEngine::new(
        Arc::new(DiskFileStore::new()),
        Arc::new(crypto),
        Arc::new(CommandRunner::new()),
        EngineConfig {
            save_delay: Duration::from_millis(50),
            vault_root: Some(root.to_path_buf()),
            ..Default::default()
        },
    )
}

fn vault() -> Vault {
    let temp = TempDir::new().unwrap();
    let root = temp.path().canonicalize().unwrap();
    init_vault(&root, Some("Test")).unwrap();
    let engine = engine_for(&root, AgeEncryptionService::new());
    Vault {
        _temp: temp,
        root,
        engine,
    }
}

async fn read_block_file(notebook: &Path, id: &quill_core::BlockId) -> String {
    let index = NotebookIndex::load(notebook).await.unwrap();
    let entry = index.entry(id).unwrap();
    std::fs::read_to_string(notebook.join(&entry.file)).unwrap()
}

#[tokio::test]
async fn test_edits_reach_disk_after_debounce() {
    let v = vault();
    let path = v.root.join("Plans.md");
    v.engine.create(&path, None).await.unwrap();
    let first = v.engine.blocks()[0].id.clone();

    let code = v
        .engine
        .add_block(BlockType::Code, Some(Language::Shell), Some(&first))
        .await
        .unwrap();
    v.engine.update_content(&code, "echo saved").unwrap();
    assert!(v.engine.is_dirty(&code));
    assert_eq!(read_block_file(&path, &code).await, "");

    tokio::time::timeout(Duration::from_secs(5), async {
        while v.engine.is_dirty(&code) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(read_block_file(&path, &code).await, "echo saved");

    v.engine.close().await;
    v.engine.open(&path).await.unwrap();
    let blocks = v.engine.blocks();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[1].content, "echo saved");
    assert_eq!(blocks[1].language, Some(Language::Shell));
}

#[tokio::test]
async fn test_encrypted_block_is_stored_sealed() {
    let v = vault();
    let id_file = v.root.join(".quill").join("identity.txt");
    generate_identity(&id_file).unwrap();

    let crypto = AgeEncryptionService::new();
    crypto.unlock(Credential::IdentityFile(id_file.clone())).unwrap();
    let engine = engine_for(&v.root, crypto);

    let path = v.root.join("Secrets.md");
    engine.create(&path, Some("Secrets")).await.unwrap();
    let id = engine.blocks()[0].id.clone();
    engine.update_content(&id, "the launch code").unwrap();

    engine.encrypt_block(&id).await.unwrap();
    engine.save_all().await.unwrap();

    let on_disk = read_block_file(&path, &id).await;
    assert!(is_armored(&on_disk));
    assert!(!on_disk.contains("launch"));
    let index = NotebookIndex::load(&path).await.unwrap();
    assert_eq!(index.entry(&id).unwrap().encrypted, Some(true));

    engine.decrypt_block(&id).await.unwrap();
    assert_eq!(engine.encryption_state(&id), Some(EncryptionState::Visible));
    assert_eq!(
        engine.display_content(&id).as_deref(),
        Some("the launch code")
    );
    assert_eq!(engine.get_block(&id).unwrap().content, on_disk);
}

#[tokio::test]
async fn test_password_request_resumes_with_age_password() {
    let v = vault();
    let path = v.root.join("Diary.md");
    v.engine.create(&path, None).await.unwrap();
    let id = v.engine.blocks()[0].id.clone();
    let mut events = v.engine.subscribe();

    let err = v.engine.encrypt_block(&id).await.unwrap_err();
    assert!(err.needs_password());
    let pending = v.engine.pending_password_request().unwrap();
    assert_eq!(pending.block_id, id);

    let mut saw_request = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, EngineEvent::PasswordRequired { .. }) {
            saw_request = true;
        }
    }
    assert!(saw_request);

    v.engine.supply_password("pa55word").await.unwrap();
    assert!(v.engine.pending_password_request().is_none());
    assert_eq!(v.engine.encryption_state(&id), Some(EncryptionState::Hidden));

    v.engine.remove_block_encryption(&id).await.unwrap();
    assert_eq!(v.engine.get_block(&id).unwrap().content, "# Diary\n\n");
}

#[tokio::test]
async fn test_auto_unlock_from_credentials_file() {
    let v = vault();
    let id_file = v.root.join("id.txt");
    generate_identity(&id_file).unwrap();
    let creds = v.root.join("credentials.yaml");
    std::fs::write(&creds, format!("identity_file: {}\n", id_file.display())).unwrap();

    let crypto = AgeEncryptionService::with_sources(vec![Box::new(CredentialsFile::new(&creds))]);
    let engine = engine_for(&v.root, crypto);
    let path = v.root.join("Auto.md");
    engine.create(&path, None).await.unwrap();
    let id = engine.blocks()[0].id.clone();

    engine.encrypt_block(&id).await.unwrap();
    assert!(engine.pending_password_request().is_none());
    assert!(engine.is_encrypted(&id));
}

#[cfg(unix)]
#[tokio::test]
async fn test_vault_interpreters_are_used() {
    let v = vault();
    let mut config = VaultConfig::load(&v.root).unwrap();
    config.interpreters.shell = Some("sh".to_string());
    config.save(&v.root).unwrap();

    let path = v.root.join("Run.md");
    v.engine.create(&path, None).await.unwrap();
    let first = v.engine.blocks()[0].id.clone();
    let code = v
        .engine
        .add_block(BlockType::Code, Some(Language::Shell), Some(&first))
        .await
        .unwrap();
    v.engine
        .update_content(&code, "echo \"$0\"; echo from-vault")
        .unwrap();

    let output = v.engine.run_block(&code).await.unwrap().wait().await.unwrap();
    assert_eq!(output.exit_code, Some(0));
    assert!(output.stdout.ends_with("from-vault\n"));
    let argv0 = output.stdout.lines().next().unwrap();
    assert_eq!(
        Path::new(argv0).file_name().and_then(|n| n.to_str()),
        Some("sh")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_save_concurrent_with_type_change_keeps_edit() {
    let v = vault();
    let path = v.root.join("Racing.md");
    v.engine.create(&path, None).await.unwrap();
    let id = v.engine.blocks()[0].id.clone();

    for i in 0..50 {
        let text = format!("edit {}", i);
        v.engine.update_content(&id, &text).unwrap();
        let (block_type, language) = if i % 2 == 0 {
            (BlockType::Code, Some(Language::Python))
        } else {
            (BlockType::Markdown, None)
        };

        let (saved, changed) = tokio::join!(
            v.engine.save_block(&id),
            v.engine.change_type(&id, block_type, language)
        );
        saved.unwrap();
        changed.unwrap();

        assert!(!v.engine.is_dirty(&id), "round {}", i);
        assert_eq!(read_block_file(&path, &id).await, text, "round {}", i);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_save_concurrent_with_delete_leaves_no_orphan_file() {
    let v = vault();
    let path = v.root.join("Deleting.md");
    v.engine.create(&path, None).await.unwrap();
    let first = v.engine.blocks()[0].id.clone();

    for i in 0..20 {
        let id = v
            .engine
            .add_block(BlockType::Markdown, None, Some(&first))
            .await
            .unwrap();
        v.engine.update_content(&id, &format!("doomed {}", i)).unwrap();

        // The save may find the block already gone; only the files matter here.
        let (_, deleted) = tokio::join!(v.engine.save_block(&id), v.engine.delete_block(&id));
        deleted.unwrap();
    }

    let index = NotebookIndex::load(&path).await.unwrap();
    let mut files: Vec<String> = std::fs::read_dir(&path)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .filter(|name| name != ".index.json")
        .collect();
    files.sort();
    assert_eq!(index.blocks.len(), 1);
    assert_eq!(files, vec![index.blocks[0].file.clone()]);
}
