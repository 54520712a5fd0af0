/// Something that contributes a suffix to the backup file name.
pub trait FileExtProvider {
    /// The suffix including its leading dot, or an empty string when nothing is added.
    fn file_ext(&self) -> &'static str;
}
