// instancemanager/src/bootstrap/validation.rs
use std::path::Path;

use super::BootstrapRequest;
use crate::errors::ValidationError;
use crate::utils::file_exists;

fn exists(path: &Path) -> Result<bool, ValidationError> {
    file_exists(path).map_err(|source| ValidationError::Inaccessible {
        path: path.to_path_buf(),
        source,
    })
}

/// Checks the bootstrap preconditions in a fixed order and reports the
/// first violated one. Never touches the filesystem beyond `stat`.
pub fn validate(request: &BootstrapRequest) -> Result<(), ValidationError> {
    if !exists(&request.superuser_password_file)? {
        return Err(ValidationError::SuperuserPasswordFileMissing(
            request.superuser_password_file.clone(),
        ));
    }

    if !exists(&request.application_password_file)? {
        return Err(ValidationError::ApplicationPasswordFileMissing(
            request.application_password_file.clone(),
        ));
    }

    if exists(&request.data_directory)? {
        return Err(ValidationError::DataDirectoryExists(
            request.data_directory.clone(),
        ));
    }

    if let Some(rules) = &request.access_rules_file {
        if !exists(rules)? {
            return Err(ValidationError::AccessRulesFileMissing(rules.clone()));
        }
    }

    if let Some(extra) = &request.extra_config_file {
        if !exists(extra)? {
            return Err(ValidationError::ExtraConfigFileMissing(extra.clone()));
        }
    }

    if request.application_user.is_empty() {
        return Err(ValidationError::EmptyApplicationUser);
    }

    if request.application_database.is_empty() {
        return Err(ValidationError::EmptyApplicationDatabase);
    }

    Ok(())
}
