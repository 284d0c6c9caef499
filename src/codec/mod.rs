pub mod scope_file;
