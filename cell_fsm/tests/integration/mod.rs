mod batch;
mod faults;
mod support;
mod threaded;
