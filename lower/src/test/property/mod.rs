mod graph_props;
