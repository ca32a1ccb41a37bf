mod accumulator;
mod element;
mod projection;
mod proximity;
mod solver;
