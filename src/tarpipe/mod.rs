pub mod archive;
pub mod commit;
pub mod compress;
pub mod config;
pub mod detect;
pub mod encrypt;
pub mod file_ext;
pub mod finish;
pub mod pipeline;
pub mod redacted;
pub mod result_error;
pub mod stream;
pub mod transform;
pub mod validate;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
