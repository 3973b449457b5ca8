pub mod dao;

pub use dao::{Dao, DaoCommand, DaoHandle};
