use crate::errors::BlkError;

pub fn file_exists<P>(path: P) -> bool
where
    P: AsRef<std::path::Path>,
{
    path.as_ref().exists()
}

pub fn read_file(path: &str) -> Result<String, BlkError> {
    std::fs::read_to_string(path)
        .map_err(|err| BlkError::NoSuchFile(err, path.to_string()))
}
