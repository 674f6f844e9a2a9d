pub mod bash;
pub mod cron;
pub mod discord_send;
pub mod file_download;
pub mod fs;
pub mod http;
pub mod memory;
pub mod pdf;
pub mod trello;
pub mod weather;
pub mod web_search;
