pub mod header_oracle;
