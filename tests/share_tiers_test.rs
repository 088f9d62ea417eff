//! Access-tier semantics: private commitments with revocation, protected
//! passwords, and access-string validation.

mod common;

use std::time::Duration;

use common::{assert_trees_equal, engine_with, publish_pipeline, write_tree};
use usenetsync::publish::{AccessParams, TierParams};
use usenetsync::types::SessionStatus;
use usenetsync::Error;

fn other_user_id() -> String {
    "f0".repeat(32)
}

/// Two authorized users fetch a PRIVATE share; after revoking one, that
/// user fails with a crypto error while the other still succeeds.
#[tokio::test]
async fn test_private_share_with_revocation() {
    let env = engine_with(1000, 100, 1).await;
    let files: Vec<(&str, Vec<u8>)> = vec![("a.txt", b"hello".to_vec())];
    write_tree(env.data_dir.path(), &files);

    env.engine.initialize_user("operator").await.unwrap();
    let folder_id = env
        .engine
        .add_folder(env.data_dir.path().to_str().unwrap())
        .await
        .unwrap();
    publish_pipeline(&env, &folder_id).await;

    let owner = {
        let mut tx = env.engine.store().begin().await.unwrap();
        let user = tx.get_user().await.unwrap().unwrap();
        tx.rollback().await.unwrap();
        user.user_id
    };
    let guest = other_user_id();

    let published = env
        .engine
        .publish_folder(
            &folder_id,
            TierParams::Private {
                authorized_users: vec![owner.clone(), guest.clone()],
            },
            None,
        )
        .await
        .unwrap();
    assert!(published.access_string.is_none());

    // Both authorized identities reconstruct.
    for (user, dest) in [(&owner, "dst-owner"), (&guest, "dst-guest")] {
        let dest_path = env.dest_dir.path().join(dest);
        let session = env
            .engine
            .fetch_share(
                &published.share_id,
                AccessParams::Private {
                    user_id: user.clone(),
                },
                dest_path.to_str().unwrap(),
            )
            .await
            .unwrap();
        let progress = env
            .engine
            .wait_for_session(&session, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(progress.status, SessionStatus::Completed);
        assert_trees_equal(env.data_dir.path(), &dest_path, &files);
    }

    // Revoke the guest. Their next fetch is a crypto failure; the owner
    // is unaffected.
    env.engine
        .revoke(&published.share_id, Some(&guest))
        .await
        .unwrap();

    let err = env
        .engine
        .fetch_share(
            &published.share_id,
            AccessParams::Private { user_id: guest },
            env.dest_dir.path().join("dst-revoked").to_str().unwrap(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Crypto(_)), "got {:?}", err);

    let dest_again = env.dest_dir.path().join("dst-owner-again");
    let session = env
        .engine
        .fetch_share(
            &published.share_id,
            AccessParams::Private { user_id: owner },
            dest_again.to_str().unwrap(),
        )
        .await
        .unwrap();
    let progress = env
        .engine
        .wait_for_session(&session, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(progress.status, SessionStatus::Completed);
}

/// PROTECTED tier: the right password reconstructs, a wrong password is
/// rejected as a crypto failure without touching the substrate payload.
#[tokio::test]
async fn test_protected_share_password() {
    let env = engine_with(1000, 100, 1).await;
    let files: Vec<(&str, Vec<u8>)> = vec![("a.txt", b"hello".to_vec())];
    write_tree(env.data_dir.path(), &files);

    env.engine.initialize_user("operator").await.unwrap();
    let folder_id = env
        .engine
        .add_folder(env.data_dir.path().to_str().unwrap())
        .await
        .unwrap();
    publish_pipeline(&env, &folder_id).await;

    let published = env
        .engine
        .publish_folder(
            &folder_id,
            TierParams::Protected {
                password: "correct horse battery staple".to_string(),
            },
            None,
        )
        .await
        .unwrap();

    let good_dest = env.dest_dir.path().join("good");
    let session = env
        .engine
        .fetch_share(
            &published.share_id,
            AccessParams::Protected {
                password: "correct horse battery staple".to_string(),
            },
            good_dest.to_str().unwrap(),
        )
        .await
        .unwrap();
    let progress = env
        .engine
        .wait_for_session(&session, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(progress.status, SessionStatus::Completed);
    assert_trees_equal(env.data_dir.path(), &good_dest, &files);

    let err = env
        .engine
        .fetch_share(
            &published.share_id,
            AccessParams::Protected {
                password: "incorrect horse battery staple".to_string(),
            },
            env.dest_dir.path().join("bad").to_str().unwrap(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Crypto(_)), "got {:?}", err);
}

/// Probing share ids learns nothing: a fetch against a nonexistent share
/// id refuses with exactly the same error kind and message as wrong
/// credentials against a real one.
#[tokio::test]
async fn test_unknown_share_indistinguishable_from_bad_credentials() {
    let env = engine_with(1000, 100, 1).await;
    write_tree(env.data_dir.path(), &[("a.txt", b"hello".to_vec())]);
    env.engine.initialize_user("operator").await.unwrap();
    let folder_id = env
        .engine
        .add_folder(env.data_dir.path().to_str().unwrap())
        .await
        .unwrap();
    publish_pipeline(&env, &folder_id).await;

    let published = env
        .engine
        .publish_folder(
            &folder_id,
            TierParams::Protected {
                password: "correct horse battery staple".to_string(),
            },
            None,
        )
        .await
        .unwrap();
    let unknown_id = usenetsync::publish::Publisher::mint_share_id().unwrap();
    assert_ne!(unknown_id, published.share_id);

    let dest = env.dest_dir.path().to_str().unwrap().to_string();
    let wrong_password = env
        .engine
        .fetch_share(
            &published.share_id,
            AccessParams::Protected {
                password: "incorrect horse battery staple".to_string(),
            },
            &dest,
        )
        .await
        .unwrap_err();
    let no_such_share = env
        .engine
        .fetch_share(
            &unknown_id,
            AccessParams::Protected {
                password: "incorrect horse battery staple".to_string(),
            },
            &dest,
        )
        .await
        .unwrap_err();

    assert_eq!(wrong_password.kind(), no_such_share.kind());
    assert_eq!(wrong_password.to_string(), no_such_share.to_string());
    assert!(matches!(no_such_share, Error::Crypto(_)));

    // The same holds for the PRIVATE tier: an unauthorized identity on a
    // real share reads like any identity on a fabricated id.
    let guest = other_user_id();
    let unauthorized = env
        .engine
        .fetch_share(
            &published.share_id,
            AccessParams::Private {
                user_id: guest.clone(),
            },
            &dest,
        )
        .await
        .unwrap_err();
    let fabricated = env
        .engine
        .fetch_share(
            &unknown_id,
            AccessParams::Private { user_id: guest },
            &dest,
        )
        .await
        .unwrap_err();
    assert_eq!(unauthorized.kind(), fabricated.kind());
    assert_eq!(unauthorized.to_string(), fabricated.to_string());
}

/// A tampered or mismatched PUBLIC access string never decrypts.
#[tokio::test]
async fn test_public_access_string_is_load_bearing() {
    let env = engine_with(1000, 100, 1).await;
    write_tree(env.data_dir.path(), &[("a.txt", b"hello".to_vec())]);
    env.engine.initialize_user("operator").await.unwrap();
    let folder_id = env
        .engine
        .add_folder(env.data_dir.path().to_str().unwrap())
        .await
        .unwrap();
    publish_pipeline(&env, &folder_id).await;

    let published = env
        .engine
        .publish_folder(&folder_id, TierParams::Public, None)
        .await
        .unwrap();
    let access = published.access_string.unwrap();

    // Mangle the key bytes at the tail of the envelope.
    let mut mangled = access.clone();
    let tail = mangled.pop().unwrap();
    mangled.push(if tail == 'A' { 'B' } else { 'A' });

    let result = env
        .engine
        .fetch_share(
            &published.share_id,
            AccessParams::Public {
                access_string: mangled,
            },
            env.dest_dir.path().to_str().unwrap(),
        )
        .await;
    assert!(matches!(result, Err(Error::Crypto(_))));

    // Supplying credentials for the wrong tier is rejected too.
    let result = env
        .engine
        .fetch_share(
            &published.share_id,
            AccessParams::Protected {
                password: "whatever".to_string(),
            },
            env.dest_dir.path().to_str().unwrap(),
        )
        .await;
    assert!(matches!(result, Err(Error::Crypto(_))));
}
