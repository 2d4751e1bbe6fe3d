mod cursors;
mod items;
