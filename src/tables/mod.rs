pub mod jump;
pub mod stay_go;
pub mod translation;
