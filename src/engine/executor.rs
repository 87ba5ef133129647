//! Server-side execution of matured operations.

use std::io;

use tokio::fs;
use tracing::debug;

use super::op::{OpKind, PendingOp};
use crate::{
    activity::ActivityKind,
    error::Result,
    path::PathMap,
    placeholder::PlaceholderStore,
};

pub(crate) async fn execute(
    op: &PendingOp,
    paths: &PathMap,
    store: &PlaceholderStore,
) -> Result<ActivityKind> {
    match op.kind {
        OpKind::Create | OpKind::Modify => upload(op, paths, store).await,
        OpKind::Delete => remove(op, paths).await,
        OpKind::Rename => relocate(op, paths, store).await,
    }
}

/// Whole-file copy to the server, then the in-sync transition (which also
/// converts a brand-new regular file into a placeholder).
async fn upload(op: &PendingOp, paths: &PathMap, store: &PlaceholderStore) -> Result<ActivityKind> {
    let server_abs = paths.server_abs(&op.current_relative);

    if op.is_directory {
        fs::create_dir_all(&server_abs).await?;
    } else {
        // A dehydrated source has no bytes to copy yet.
        if store
            .state(&op.current_path)
            .map(|state| state.is_offline)
            .unwrap_or(false)
        {
            store.hydrate(&op.current_path, 0, crate::placeholder::WHOLE_FILE)?;
        }
        if let Some(parent) = server_abs.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&op.current_path, &server_abs).await?;
    }

    store.mark_in_sync(&op.current_path)?;
    Ok(ActivityKind::Uploaded)
}

async fn remove(op: &PendingOp, paths: &PathMap) -> Result<ActivityKind> {
    let server_abs = paths.server_abs(&op.current_relative);
    match fs::metadata(&server_abs).await {
        // Already gone remotely; deleting twice is not an error.
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(&server_abs).await?,
        Ok(_) => fs::remove_file(&server_abs).await?,
    }
    Ok(ActivityKind::Deleted)
}

/// Moves the server copy, then rewrites the placeholder identity so the next
/// hydration resolves the new server path. A source that never reached the
/// server degrades to a plain upload.
async fn relocate(
    op: &PendingOp,
    paths: &PathMap,
    store: &PlaceholderStore,
) -> Result<ActivityKind> {
    let original = match &op.original_relative {
        Some(original) => original,
        None => return upload(op, paths, store).await,
    };

    let server_old = paths.server_abs(original);
    let server_new = paths.server_abs(&op.current_relative);

    if !fs::try_exists(&server_old).await? {
        debug!(original = %original.display(), "rename source missing on server, uploading");
        return upload(op, paths, store).await;
    }

    if let Some(parent) = server_new.parent() {
        fs::create_dir_all(parent).await?;
    }
    // Overwrites an existing destination file, which is exactly what the
    // replace-file gesture needs.
    fs::rename(&server_old, &server_new).await?;

    store.update_identity(&op.current_path, &op.current_relative)?;
    store.mark_in_sync(&op.current_path)?;

    let crossed_directories = original.parent() != op.current_relative.parent();
    Ok(if op.detected_move || crossed_directories {
        ActivityKind::Moved
    } else {
        ActivityKind::Renamed
    })
}
