//! User prompt utilities using dialoguer

use crate::utils::error::{ImageError, Result};
use dialoguer::{theme::ColorfulTheme, Confirm};

/// Prompt for yes/no confirmation
pub fn prompt_confirm(prompt: &str, default: bool) -> Result<bool> {
    let theme = ColorfulTheme::default();
    Confirm::with_theme(&theme)
        .with_prompt(prompt)
        .default(default)
        .interact_opt()
        .map_err(|e| ImageError::Io(std::io::Error::other(e.to_string())))?
        .ok_or(ImageError::UserCancelled)
}

/// Display a warning and ask for confirmation
pub fn warn_confirm(warning: &str) -> Result<bool> {
    println!("\n⚠️  WARNING: {}\n", warning);
    prompt_confirm("Continue?", false)
}
