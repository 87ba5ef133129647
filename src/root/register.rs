//! Sync-root identity and registration with the shell.
//!
//! Registration is process-wide and persists across restarts; startup
//! re-attaches to an existing registration instead of re-registering, and
//! unregistration is an explicit operator action.

#[cfg(windows)]
use crate::{
    config::SyncConfig,
    error::{Result, SyncError},
};

/// The shell's sync-root identity format: `provider!sid!account`.
pub fn compose_id(provider: &str, security_id: &str, account: &str) -> String {
    format!("{provider}!{security_id}!{account}")
}

/// Registers the sync root for `config.client_path`, or re-attaches if the
/// identity is already registered. Returns the identity string.
#[cfg(windows)]
pub fn ensure_registered(config: &SyncConfig) -> Result<String> {
    use tracing::info;
    use windows::{
        core::HSTRING,
        Storage::{
            Provider::{
                StorageProviderHardlinkPolicy, StorageProviderHydrationPolicy,
                StorageProviderHydrationPolicyModifier, StorageProviderInSyncPolicy,
                StorageProviderPopulationPolicy, StorageProviderSyncRootInfo,
                StorageProviderSyncRootManager,
            },
            StorageFolder,
        },
    };

    let id = compose_id(
        &config.provider_name,
        &current_user_sid()?,
        &config.account_name,
    );
    let hstring_id = HSTRING::from(id.as_str());

    if StorageProviderSyncRootManager::GetSyncRootInformationForId(&hstring_id).is_ok() {
        info!(%id, "re-attaching to existing sync root");
        return Ok(id);
    }

    let folder = StorageFolder::GetFolderFromPathAsync(&HSTRING::from(
        config.client_path.as_os_str().to_string_lossy().as_ref(),
    ))?
    .get()?;

    let info = StorageProviderSyncRootInfo::new()?;
    info.SetId(&hstring_id)?;
    info.SetPath(&folder)?;
    info.SetDisplayNameResource(&HSTRING::from(config.display_name()))?;
    info.SetIconResource(&HSTRING::from("%SystemRoot%\\system32\\imageres.dll,-1043"))?;
    info.SetVersion(&HSTRING::from(env!("CARGO_PKG_VERSION")))?;
    info.SetHydrationPolicy(StorageProviderHydrationPolicy::Full)?;
    info.SetHydrationPolicyModifier(StorageProviderHydrationPolicyModifier::AutoDehydrationAllowed)?;
    info.SetPopulationPolicy(StorageProviderPopulationPolicy::AlwaysFull)?;
    info.SetInSyncPolicy(
        StorageProviderInSyncPolicy::FileCreationTime
            | StorageProviderInSyncPolicy::DirectoryCreationTime,
    )?;
    info.SetHardlinkPolicy(StorageProviderHardlinkPolicy::None)?;

    StorageProviderSyncRootManager::Register(&info)?;
    info!(%id, path = %config.client_path.display(), "sync root registered");
    Ok(id)
}

/// Removes the registration. Placeholders lose their cloud state.
#[cfg(windows)]
pub fn unregister(id: &str) -> Result<()> {
    use windows::{core::HSTRING, Storage::Provider::StorageProviderSyncRootManager};

    StorageProviderSyncRootManager::Unregister(&HSTRING::from(id))?;
    Ok(())
}

/// The string SID of the logged-in user, e.g. `S-1-5-21-…`.
#[cfg(windows)]
fn current_user_sid() -> Result<String> {
    use widestring::U16CStr;
    use windows::Win32::{
        Foundation::{LocalFree, ERROR_INSUFFICIENT_BUFFER, HANDLE, HLOCAL},
        Security::{self, Authorization::ConvertSidToStringSidW, GetTokenInformation, TOKEN_USER},
    };

    // Pseudo handle for the current thread's effective token.
    let token = HANDLE(-6isize as _);

    unsafe {
        let mut size = 0u32;
        if let Err(e) = GetTokenInformation(token, Security::TokenUser, None, 0, &mut size) {
            if e.code() != ERROR_INSUFFICIENT_BUFFER.to_hresult() {
                return Err(SyncError::Os(e));
            }
        }

        let mut buffer = vec![0u8; size as usize];
        GetTokenInformation(
            token,
            Security::TokenUser,
            Some(buffer.as_mut_ptr() as *mut _),
            size,
            &mut size,
        )?;

        let token_user = &*(buffer.as_ptr() as *const TOKEN_USER);
        let mut sid = windows::core::PWSTR::null();
        ConvertSidToStringSidW(token_user.User.Sid, &mut sid)?;

        let text = U16CStr::from_ptr_str(sid.0).to_string_lossy();
        let _ = LocalFree(HLOCAL(sid.0 as *mut _));
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::compose_id;

    #[test]
    fn identity_joins_with_exclamation_points() {
        assert_eq!(
            compose_id("NuviiSync", "S-1-5-21-1234", "NuviiAccount"),
            "NuviiSync!S-1-5-21-1234!NuviiAccount"
        );
    }
}
