pub mod window_ticker;
