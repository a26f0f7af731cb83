//! Safety checks to prevent accidental clobbering of input files.

use std::path::Path;

use crate::error::LinkError;

/// Refuse an output path that would overwrite any of the run's inputs.
pub fn validate_output_path(output: &Path, input_paths: &[&Path]) -> Result<(), LinkError> {
    for input in input_paths {
        if output == *input {
            return Err(LinkError::config(format!(
                "output '{}' would overwrite input '{}'",
                output.display(),
                input.display()
            )));
        }
    }
    if output.is_dir() {
        return Err(LinkError::config(format!(
            "output '{}' is a directory",
            output.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_distinct_output_is_fine() {
        let output = PathBuf::from("/tmp/results.csv");
        let input = PathBuf::from("/data/sample.csv");
        assert!(validate_output_path(&output, &[&input]).is_ok());
    }

    #[test]
    fn test_output_equal_to_input_is_rejected() {
        let path = PathBuf::from("/data/sample.csv");
        let err = validate_output_path(&path, &[&path]).unwrap_err();
        assert!(err.to_string().contains("would overwrite"));
        assert_eq!(err.exit_code(), 2);
    }
}
