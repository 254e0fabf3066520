pub mod agent;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod feedback;
pub mod fpcache;
pub mod fpfilter;
pub mod git;
pub mod parser;
pub mod pipeline;
pub mod process;
pub mod prompts;
pub mod report;
pub mod runner;
pub mod stats;
pub mod summarizer;
pub mod terminal;
