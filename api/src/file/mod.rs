pub mod ion;
