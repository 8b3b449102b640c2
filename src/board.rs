/// Hardware abstraction for supported boards.
///
/// Each board module defines pin assignments and capabilities
/// selected at compile time via feature flags.

#[cfg(feature = "board-devkit")]
mod hw {
    pub const TRIG_PIN: u8 = 12;
    pub const ECHO_PIN: u8 = 27;
    pub const LED_PIN: u8 = 2; // Built-in status LED
    pub const UART_RX_PIN: u8 = 3;
    pub const UART_TX_PIN: u8 = 1;
    pub const BOARD_NAME: &str = "esp32_devkit";
}

#[cfg(feature = "board-xiao")]
mod hw {
    pub const TRIG_PIN: u8 = 2;
    pub const ECHO_PIN: u8 = 3;
    pub const LED_PIN: u8 = 21;
    pub const UART_RX_PIN: u8 = 44;
    pub const UART_TX_PIN: u8 = 43;
    pub const BOARD_NAME: &str = "xiao_esp32s3";
}

#[cfg(not(any(feature = "board-devkit", feature = "board-xiao")))]
mod hw {
    pub const BOARD_NAME: &str = "unknown";
}

pub use hw::*;
