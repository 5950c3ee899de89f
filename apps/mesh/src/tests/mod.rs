mod mesh_test;
mod support;
